//! Layered CLI configuration
//!
//! Sources, later ones winning:
//! 1. Built-in defaults
//! 2. `vision-infer.{toml,yaml,json}` in the working directory, or the file
//!    given with `--config`
//! 3. Environment variables with the `VISION_INFER__` prefix, `__` between
//!    levels, e.g. `VISION_INFER__ENGINE__MAX_BATCH_SIZE=8`

use std::path::{Path, PathBuf};

use gpu_device::Normalization;
use inference_engine::EngineOptions;
use serde::Deserialize;

const DEFAULT_FILE: &str = "vision-infer";
const ENV_PREFIX: &str = "VISION_INFER";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// ONNX model used when the command line does not name one
    pub model_path: Option<PathBuf>,
    /// Where engine artifacts are cached
    pub cache_dir: PathBuf,
    pub engine: EngineOptions,
    pub normalization: NormalizationSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NormalizationSettings {
    pub subtract: [f32; 3],
    pub divide: [f32; 3],
}

impl Default for NormalizationSettings {
    fn default() -> Self {
        let norm = Normalization::default();
        Self {
            subtract: norm.subtract,
            divide: norm.divide,
        }
    }
}

impl From<&NormalizationSettings> for Normalization {
    fn from(s: &NormalizationSettings) -> Self {
        Normalization::new(s.subtract, s.divide)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `trace`, `debug`, `info`, `warn` or `error`
    pub level: String,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Settings {
    /// Load from the optional file plus the process environment
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        Self::load_with_env(path, environment())
    }

    fn load_with_env(
        path: Option<&Path>,
        env: config::Environment,
    ) -> Result<Self, config::ConfigError> {
        let file = match path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name(DEFAULT_FILE).required(false),
        };
        let mut settings: Settings = config::Config::builder()
            .add_source(file)
            .add_source(env)
            .build()?
            .try_deserialize()?;
        if settings.cache_dir.as_os_str().is_empty() {
            settings.cache_dir = PathBuf::from(".");
        }
        Ok(settings)
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("engine.optimal_batch_sizes")
}
