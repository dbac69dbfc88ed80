//! Engine handle: options, backend, diagnostics, and the loaded network

use std::path::{Path, PathBuf};
use std::sync::Arc;

use gpu_device::CudaStream;

use crate::backend::{default_backend, Backend, Binding, CompiledGraph, ExecutionContext};
use crate::logger::{Logger, Severity, TracingLogger};
use crate::options::{EngineOptions, Precision};
use crate::EngineError;

/// Per batch element, per output binding, the flattened output values
pub type FeatureVectors = Vec<Vec<Vec<f32>>>;

/// Deserialized engine with its execution state.
///
/// Field order is drop order: the context goes before the engine it was
/// created from.
pub(crate) struct LoadedNetwork {
    pub(crate) context: Box<dyn ExecutionContext>,
    pub(crate) _graph: Box<dyn CompiledGraph>,
    pub(crate) stream: CudaStream,
    pub(crate) bindings: Vec<Binding>,
    pub(crate) input_height: u32,
    pub(crate) input_width: u32,
    /// Required batch size when the engine was built without dynamic batching
    pub(crate) fixed_batch: Option<usize>,
}

/// Builds, loads, and runs one optimized network.
///
/// The options are borrowed for the engine's whole lifetime. One engine serves
/// one caller at a time; `run_inference` takes `&mut self`.
pub struct Engine<'a> {
    pub(crate) options: &'a EngineOptions,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) logger: Arc<dyn Logger>,
    pub(crate) cache_dir: PathBuf,
    pub(crate) engine_path: Option<PathBuf>,
    pub(crate) precision: Option<Precision>,
    pub(crate) network: Option<LoadedNetwork>,
}

impl<'a> Engine<'a> {
    /// Engine on the default backend, logging through `tracing`, caching
    /// artifacts in the working directory
    pub fn new(options: &'a EngineOptions) -> Self {
        Self {
            options,
            backend: default_backend(),
            logger: Arc::new(TracingLogger::default()),
            cache_dir: PathBuf::from("."),
            engine_path: None,
            precision: None,
            network: None,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Directory holding engine artifacts
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn options(&self) -> &EngineOptions {
        self.options
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Artifact resolved by the last successful `build`
    pub fn engine_path(&self) -> Option<&Path> {
        self.engine_path.as_deref()
    }

    /// Precision the artifact was built with, after any fallback
    pub fn precision(&self) -> Option<Precision> {
        self.precision
    }

    pub fn is_loaded(&self) -> bool {
        self.network.is_some()
    }

    /// Bindings of the loaded network, empty before `load_network`
    pub fn bindings(&self) -> &[Binding] {
        self.network.as_ref().map(|n| n.bindings.as_slice()).unwrap_or(&[])
    }

    pub fn input_height(&self) -> Option<u32> {
        self.network.as_ref().map(|n| n.input_height)
    }

    pub fn input_width(&self) -> Option<u32> {
        self.network.as_ref().map(|n| n.input_width)
    }

    /// Batch size a fixed-batch engine requires
    pub fn fixed_batch_size(&self) -> Option<usize> {
        self.network.as_ref().and_then(|n| n.fixed_batch)
    }

    /// Send a failure to the diagnostics sink before handing it back
    pub(crate) fn report(&self, err: EngineError) -> EngineError {
        self.logger.log(Severity::Error, &err.to_string());
        err
    }
}

impl std::fmt::Debug for Engine<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("backend", &self.backend.name())
            .field("cache_dir", &self.cache_dir)
            .field("engine_path", &self.engine_path)
            .field("precision", &self.precision)
            .field("loaded", &self.network.is_some())
            .finish()
    }
}
