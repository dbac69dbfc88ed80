//! Engine build and runtime options

use serde::{Deserialize, Serialize};

use crate::EngineError;

/// Numeric precision the optimizer builds the engine for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// Full precision (32-bit float)
    Fp32,
    /// Half precision (16-bit float). Faster, may reduce accuracy.
    Fp16,
}

impl Precision {
    /// Tag used in artifact names
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Fp32 => "fp32",
            Precision::Fp16 => "fp16",
        }
    }
}

/// Options for building and running an engine.
///
/// The engine borrows these for its whole lifetime; they cannot change while
/// an engine uses them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Build an engine that accepts any batch size up to `max_batch_size`
    pub dynamic_batch_supported: bool,
    /// Precision to use for GPU inference
    pub precision: Precision,
    /// Batch sizes the optimizer tunes kernels for
    pub optimal_batch_sizes: Vec<u32>,
    /// Maximum allowable batch size
    pub max_batch_size: u32,
    /// Max GPU memory the optimizer may use as scratch space, in bytes.
    /// Give the builder as much as you can afford; at runtime it typically
    /// uses less.
    pub max_workspace_bytes: u64,
    /// GPU device index
    pub device_index: u32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            dynamic_batch_supported: true,
            precision: Precision::Fp16,
            optimal_batch_sizes: vec![1],
            max_batch_size: 16,
            max_workspace_bytes: 4_000_000_000,
            device_index: 0,
        }
    }
}

impl EngineOptions {
    /// Check the options before any device work
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_batch_size == 0 {
            return Err(EngineError::Configuration(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.optimal_batch_sizes.is_empty() {
            return Err(EngineError::Configuration(
                "optimal_batch_sizes must not be empty".to_string(),
            ));
        }
        if let Some(bad) = self
            .optimal_batch_sizes
            .iter()
            .find(|s| **s == 0 || **s > self.max_batch_size)
        {
            return Err(EngineError::Configuration(format!(
                "optimal batch size {} is outside [1, {}]",
                bad, self.max_batch_size
            )));
        }
        let sorted = self.sorted_optimal_batch_sizes();
        if sorted.windows(2).any(|w| w[0] == w[1]) {
            return Err(EngineError::Configuration(format!(
                "optimal_batch_sizes contains duplicates: {:?}",
                self.optimal_batch_sizes
            )));
        }
        if self.max_workspace_bytes == 0 {
            return Err(EngineError::Configuration(
                "max_workspace_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Optimal batch sizes in ascending order
    pub fn sorted_optimal_batch_sizes(&self) -> Vec<u32> {
        let mut sizes = self.optimal_batch_sizes.clone();
        sizes.sort_unstable();
        sizes
    }
}
