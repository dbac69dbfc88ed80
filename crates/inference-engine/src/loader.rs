//! Engine loader: deserialize the artifact into an executable network

use std::sync::Arc;

use gpu_device::CudaStream;
use tracing::info;

use crate::artifact;
use crate::engine::{Engine, LoadedNetwork};
use crate::EngineError;

impl<'a> Engine<'a> {
    /// Load the artifact resolved by the last `build` and prepare one
    /// execution context and stream for it.
    ///
    /// Either everything succeeds and the new network replaces any previous
    /// one, or the engine is left exactly as it was.
    pub fn load_network(&mut self) -> Result<(), EngineError> {
        let network = self.try_load().map_err(|e| self.report(e))?;
        // The previous network, if any, drops here: context first, then engine
        self.network = Some(network);
        Ok(())
    }

    fn try_load(&self) -> Result<LoadedNetwork, EngineError> {
        let path = self.engine_path.as_deref().ok_or_else(|| {
            EngineError::Artifact("no engine artifact resolved, call build() first".to_string())
        })?;
        let plan = artifact::read_artifact(path)?;

        gpu_device::set_device(self.options.device_index)?;

        let graph = self
            .backend
            .deserialize(&plan, self.options.device_index, Arc::clone(&self.logger))?;
        let bindings = graph.bindings().to_vec();

        let input = bindings
            .iter()
            .find(|b| b.is_input())
            .ok_or_else(|| EngineError::Artifact("engine has no input binding".to_string()))?;
        let (channels, height, width) = match input.dims.as_slice() {
            [_, c, h, w] if *c > 0 && *h > 0 && *w > 0 => (*c, *h as u32, *w as u32),
            dims => {
                return Err(EngineError::Artifact(format!(
                    "input binding {} has unexpected shape {:?}",
                    input.name, dims
                )))
            }
        };
        if channels != gpu_device::CHANNELS as i64 {
            return Err(EngineError::Artifact(format!(
                "input binding {} has {} channels, images have {}",
                input.name,
                channels,
                gpu_device::CHANNELS
            )));
        }
        if !bindings.iter().any(|b| !b.is_input()) {
            return Err(EngineError::Artifact("engine has no output bindings".to_string()));
        }

        let fixed_batch = if self.options.dynamic_batch_supported {
            None
        } else {
            Some(
                input
                    .dims
                    .first()
                    .filter(|d| **d > 0)
                    .map(|d| *d as usize)
                    .unwrap_or(self.options.max_batch_size as usize),
            )
        };

        let context = graph.create_context()?;
        let stream = CudaStream::new()?;
        info!(
            "Loaded engine {} ({} bindings, input {}x{})",
            path.display(),
            bindings.len(),
            width,
            height
        );

        Ok(LoadedNetwork {
            context,
            _graph: graph,
            stream,
            bindings,
            input_height: height,
            input_width: width,
            fixed_batch,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use crate::logger::Severity;
    use crate::testing::{self, CapturingLogger};
    use crate::{BindingDirection, Engine, EngineError, EngineOptions, Precision};

    fn options() -> EngineOptions {
        EngineOptions {
            precision: Precision::Fp32,
            max_batch_size: 4,
            optimal_batch_sizes: vec![1, 2],
            ..Default::default()
        }
    }

    #[test]
    fn test_load_without_build_fails() {
        let options = options();
        let mut engine = Engine::new(&options);
        let err = engine.load_network().unwrap_err();
        assert!(matches!(err, EngineError::Artifact(_)));
        assert!(!engine.is_loaded());
    }

    #[test]
    fn test_load_exposes_bindings_and_input_size() {
        let dir = tempfile::tempdir().unwrap();
        let model =
            testing::write_model(dir.path(), "net.onnx", &testing::pooling_model(3, 12, 16));
        let options = options();
        let mut engine = Engine::new(&options).with_cache_dir(dir.path());
        engine.build(&model).unwrap();
        engine.load_network().unwrap();

        assert!(engine.is_loaded());
        assert_eq!(engine.input_height(), Some(12));
        assert_eq!(engine.input_width(), Some(16));
        assert_eq!(engine.fixed_batch_size(), None);

        let bindings = engine.bindings();
        assert_eq!(bindings.len(), 3);
        assert_eq!(bindings[0].direction, BindingDirection::Input);
        assert_eq!(bindings[0].elements_per_item, 3 * 12 * 16);
        assert!(bindings[1..]
            .iter()
            .all(|b| b.direction == BindingDirection::Output && b.elements_per_item == 3));
    }

    #[test]
    fn test_corrupt_artifact_leaves_engine_unloaded() {
        let dir = tempfile::tempdir().unwrap();
        let model = testing::write_model(dir.path(), "net.onnx", &testing::pooling_model(3, 8, 8));
        let options = options();
        let logger = Arc::new(CapturingLogger::default());
        let mut engine = Engine::new(&options)
            .with_logger(logger.clone())
            .with_cache_dir(dir.path());
        engine.build(&model).unwrap();

        fs::write(engine.engine_path().unwrap(), b"\xde\xad\xbe\xef not a plan").unwrap();
        let err = engine.load_network().unwrap_err();
        assert!(matches!(err, EngineError::Artifact(_)));
        assert!(!engine.is_loaded());
        assert_eq!(logger.messages_at(Severity::Error).len(), 1);
    }

    #[test]
    fn test_failed_reload_keeps_previous_network() {
        let dir = tempfile::tempdir().unwrap();
        let model = testing::write_model(dir.path(), "net.onnx", &testing::pooling_model(3, 8, 8));
        let options = options();
        let mut engine = Engine::new(&options).with_cache_dir(dir.path());
        engine.build(&model).unwrap();
        engine.load_network().unwrap();

        fs::write(engine.engine_path().unwrap(), b"garbage").unwrap();
        assert!(engine.load_network().is_err());
        assert!(engine.is_loaded());
        assert_eq!(engine.input_width(), Some(8));
    }

    #[test]
    fn test_fixed_engine_reports_batch_size() {
        let dir = tempfile::tempdir().unwrap();
        let model = testing::write_model(dir.path(), "net.onnx", &testing::pooling_model(3, 8, 8));
        let options = EngineOptions {
            dynamic_batch_supported: false,
            max_batch_size: 3,
            optimal_batch_sizes: vec![3],
            precision: Precision::Fp32,
            ..Default::default()
        };
        let mut engine = Engine::new(&options).with_cache_dir(dir.path());
        engine.build(&model).unwrap();
        engine.load_network().unwrap();
        assert_eq!(engine.fixed_batch_size(), Some(3));
        assert_eq!(engine.bindings()[0].dims[0], 3);
    }
}
