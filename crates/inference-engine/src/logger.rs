//! Diagnostics sink for optimizer and engine messages

use std::fmt;

use tracing::{debug, error, info, warn};

const DIAGNOSTICS: &str = "inference_engine::diagnostics";

/// Message severity, most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    InternalError = 0,
    Error = 1,
    Warning = 2,
    Info = 3,
    Verbose = 4,
}

impl Severity {
    /// Map a TensorRT `ILogger::Severity` value
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Severity::InternalError,
            1 => Severity::Error,
            2 => Severity::Warning,
            3 => Severity::Info,
            _ => Severity::Verbose,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::InternalError => "internal_error",
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
            Severity::Verbose => "verbose",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives severity-levelled messages from the optimizer, the runtime, and
/// the engine's own failure paths
pub trait Logger: Send + Sync {
    fn log(&self, severity: Severity, message: &str);
}

/// Forwards messages at or above a severity threshold to `tracing`
#[derive(Debug, Clone, Copy)]
pub struct TracingLogger {
    threshold: Severity,
}

impl TracingLogger {
    pub fn new(threshold: Severity) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> Severity {
        self.threshold
    }

    /// Whether a message of `severity` passes the threshold
    pub fn enabled(&self, severity: Severity) -> bool {
        severity <= self.threshold
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new(Severity::Warning)
    }
}

impl Logger for TracingLogger {
    fn log(&self, severity: Severity, message: &str) {
        if !self.enabled(severity) {
            return;
        }
        match severity {
            Severity::InternalError | Severity::Error => error!(target: DIAGNOSTICS, "{}", message),
            Severity::Warning => warn!(target: DIAGNOSTICS, "{}", message),
            Severity::Info => info!(target: DIAGNOSTICS, "{}", message),
            Severity::Verbose => debug!(target: DIAGNOSTICS, "{}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_order() {
        assert!(Severity::InternalError < Severity::Error);
        assert!(Severity::Warning < Severity::Info);
        assert_eq!(Severity::from_raw(2), Severity::Warning);
        assert_eq!(Severity::from_raw(42), Severity::Verbose);
    }

    #[test]
    fn test_default_threshold_is_warning() {
        let logger = TracingLogger::default();
        assert!(logger.enabled(Severity::Error));
        assert!(logger.enabled(Severity::Warning));
        assert!(!logger.enabled(Severity::Info));
        assert!(!logger.enabled(Severity::Verbose));
    }
}
