//! Engine builder: produce or reuse the optimized artifact for a model

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use crate::artifact;
use crate::backend::{BuildConfig, NetworkDefinition, OptimizationProfile, TensorDesc};
use crate::cache_key;
use crate::engine::Engine;
use crate::fingerprint;
use crate::logger::Severity;
use crate::options::{EngineOptions, Precision};
use crate::EngineError;

/// What `build` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// A matching artifact already existed; nothing was parsed or optimized
    Cached,
    /// The model was optimized and the artifact written
    Built,
}

impl<'a> Engine<'a> {
    /// Build the optimized engine for `model_path`, or reuse a cached one.
    ///
    /// The artifact lands in the cache directory under a name derived from the
    /// model, the options, the precision actually used, and the GPU, so a
    /// second call with the same inputs is a cache hit.
    pub fn build(&mut self, model_path: impl AsRef<Path>) -> Result<BuildOutcome, EngineError> {
        self.try_build(model_path.as_ref()).map_err(|e| self.report(e))
    }

    fn try_build(&mut self, model_path: &Path) -> Result<BuildOutcome, EngineError> {
        self.options.validate()?;
        let device = fingerprint::device_fingerprint(self.options.device_index)?;
        let precision = self.resolve_precision();

        let name = cache_key::artifact_name(model_path, self.options, precision, &device)?;
        let path = self.cache_dir.join(name);

        if path.exists() {
            info!("Engine found, not regenerating: {}", path.display());
            self.engine_path = Some(path);
            self.precision = Some(precision);
            return Ok(BuildOutcome::Cached);
        }

        info!("Engine not found at {}, generating", path.display());
        let model = fs::read(model_path).map_err(|e| {
            EngineError::Model(format!("unable to read model {}: {}", model_path.display(), e))
        })?;
        let network = self.backend.parse_network(&model, Arc::clone(&self.logger))?;
        let input = validate_network(network.as_ref())?;
        let profiles = optimization_profiles(self.options, &input)?;

        let config = BuildConfig {
            precision,
            max_workspace_bytes: self.options.max_workspace_bytes,
            profiles,
            device_index: self.options.device_index,
            device_fingerprint: device,
        };
        let started = Instant::now();
        let plan = network.build_serialized(&config)?;
        artifact::write_atomic(&path, &plan)?;
        info!(
            "Built {} engine with {} profile(s) in {:.2}s, saved to {}",
            precision.as_str(),
            config.profiles.len(),
            started.elapsed().as_secs_f64(),
            path.display()
        );

        self.engine_path = Some(path);
        self.precision = Some(precision);
        Ok(BuildOutcome::Built)
    }

    fn resolve_precision(&self) -> Precision {
        match self.options.precision {
            Precision::Fp16
                if !self
                    .backend
                    .supports_fast_fp16(self.options.device_index, Arc::clone(&self.logger)) =>
            {
                self.logger.log(
                    Severity::Warning,
                    "GPU does not support FP16 precision, building the engine in FP32",
                );
                Precision::Fp32
            }
            requested => requested,
        }
    }
}

/// Check the graph shape the runner depends on and return its input
fn validate_network(network: &dyn NetworkDefinition) -> Result<TensorDesc, EngineError> {
    let input = match network.inputs() {
        [only] => only,
        inputs => {
            return Err(EngineError::Model(format!(
                "model must have exactly one input, found {}",
                inputs.len()
            )))
        }
    };
    if input.rank() != 4 {
        return Err(EngineError::Model(format!(
            "input {} must be [N, C, H, W], got shape {:?}",
            input.name, input.dims
        )));
    }
    if input.dims[1] != gpu_device::CHANNELS as i64 || input.dims[2] <= 0 || input.dims[3] <= 0 {
        return Err(EngineError::Model(format!(
            "input {} needs static [3, H, W] item dimensions, got {:?}",
            input.name, input.dims
        )));
    }
    if input.data_type != crate::DataType::Float {
        return Err(EngineError::Model(format!(
            "input {} must be float, got {:?}",
            input.name, input.data_type
        )));
    }

    if network.outputs().is_empty() {
        return Err(EngineError::Model("model has no outputs".to_string()));
    }
    if let Some(output) = network.outputs().iter().find(|o| o.elements_per_item().is_none()) {
        return Err(EngineError::Model(format!(
            "output {} has non-static per-item shape {:?}",
            output.name, output.dims
        )));
    }
    Ok(input.clone())
}

/// Profiles handed to the optimizer.
///
/// Dynamic engines get `[1, 1, max]` plus `[1, s, max]` for each other
/// optimal size. Fixed engines get one degenerate profile at the model's
/// static batch, or at `max_batch_size` when the model's batch is dynamic.
pub(crate) fn optimization_profiles(
    options: &EngineOptions,
    input: &TensorDesc,
) -> Result<Vec<OptimizationProfile>, EngineError> {
    let max = options.max_batch_size;

    if options.dynamic_batch_supported {
        if let Some(static_batch) = input.batch_dim() {
            return Err(EngineError::Configuration(format!(
                concat!(
                    "model input {} has a static batch dimension of {}; ",
                    "build with dynamic_batch_supported = false"
                ),
                input.name, static_batch
            )));
        }
        let mut profiles = vec![OptimizationProfile { min: 1, opt: 1, max }];
        profiles.extend(
            options
                .sorted_optimal_batch_sizes()
                .into_iter()
                .filter(|s| *s != 1)
                .map(|opt| OptimizationProfile { min: 1, opt, max }),
        );
        return Ok(profiles);
    }

    let fixed = match input.batch_dim() {
        Some(b) if b > max as usize => {
            return Err(EngineError::Configuration(format!(
                "model batch dimension {} exceeds max_batch_size {}",
                b, max
            )))
        }
        Some(b) => b as u32,
        None => max,
    };
    Ok(vec![OptimizationProfile {
        min: fixed,
        opt: fixed,
        max: fixed,
    }])
}
