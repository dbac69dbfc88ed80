//! ONNX Inference Engine
//!
//! Builds an optimized engine from an ONNX model once per
//! (model, options, GPU) combination, caches it on disk, and runs batched
//! inference on images resident in device memory.
//!
//! ```no_run
//! use gpu_device::{DeviceImage, Normalization};
//! use inference_engine::{Engine, EngineOptions, Precision};
//!
//! # fn main() -> Result<(), inference_engine::EngineError> {
//! let options = EngineOptions {
//!     precision: Precision::Fp16,
//!     optimal_batch_sizes: vec![1, 4, 8],
//!     max_batch_size: 8,
//!     ..Default::default()
//! };
//! let mut engine = Engine::new(&options);
//! engine.build("resnet.onnx")?;
//! engine.load_network()?;
//!
//! let image = DeviceImage::filled(224, 224, [128, 128, 128])?;
//! let features = engine.run_inference(&[image], &Normalization::default())?;
//! assert_eq!(features.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod backend;
mod artifact;
mod batcher;
mod builder;
pub mod cache_key;
mod engine;
pub mod fingerprint;
mod loader;
pub mod logger;
mod options;
mod runner;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{default_backend, Backend, Binding, BindingDirection, DataType};
pub use batcher::{BatchSender, ImageFeatures, InferenceBatcher};
pub use builder::BuildOutcome;
pub use engine::{Engine, FeatureVectors};
pub use gpu_device::{DeviceImage, Normalization};
pub use logger::{Logger, Severity, TracingLogger};
pub use options::{EngineOptions, Precision};

use gpu_device::DeviceError;
use thiserror::Error;

/// Errors from building, loading, or running an engine
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Invalid options or call arguments, detected before any device work
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Model file missing, unreadable, or with an unsupported graph
    #[error("Model error: {0}")]
    Model(String),

    /// Requested device or feature not available on this host
    #[error("Unsupported capability: {0}")]
    Capability(String),

    /// The optimizer could not produce an engine
    #[error("Engine build failed: {0}")]
    Build(String),

    /// Cached engine missing, unreadable, or incompatible
    #[error("Engine artifact error: {0}")]
    Artifact(String),

    /// Device memory or execution failure during inference
    #[error("Inference failed: {0}")]
    Runtime(String),
}

impl From<DeviceError> for EngineError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::InvalidDevice { .. } => EngineError::Capability(err.to_string()),
            DeviceError::InvalidArgument(_) => EngineError::Configuration(err.to_string()),
            DeviceError::Cuda { .. } | DeviceError::OutOfMemory(_) => {
                EngineError::Runtime(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_errors_map_to_categories() {
        let invalid = EngineError::from(DeviceError::InvalidDevice { index: 2, count: 1 });
        assert!(matches!(invalid, EngineError::Capability(_)));

        let oom = EngineError::from(DeviceError::OutOfMemory(1 << 30));
        assert!(matches!(oom, EngineError::Runtime(_)));

        let arg = EngineError::from(DeviceError::InvalidArgument("bad".into()));
        assert!(matches!(arg, EngineError::Configuration(_)));
    }
}
