//! Artifact cache key
//!
//! Every input that changes the optimized engine is encoded into its file
//! name, so an existing file can be reused without inspecting it:
//!
//! `<stem>.engine.<device>.<fp16|fp32>.<dyn|fixed>.<max>.<opt_opt_..>.<workspace>`

use std::path::Path;

use crate::options::{EngineOptions, Precision};
use crate::EngineError;

/// File name of the cached engine for `model_path` built with `options` at
/// `precision` on the device identified by `device_fingerprint`.
///
/// `precision` is passed separately because it is the precision actually used,
/// which differs from `options.precision` when the device lacks fast fp16.
pub fn artifact_name(
    model_path: &Path,
    options: &EngineOptions,
    precision: Precision,
    device_fingerprint: &str,
) -> Result<String, EngineError> {
    let stem = model_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            EngineError::Model(format!("model path {} has no file name", model_path.display()))
        })?;

    let optimal = options
        .sorted_optimal_batch_sizes()
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join("_");

    Ok(format!(
        "{}.engine.{}.{}.{}.{}.{}.{}",
        stem,
        device_fingerprint,
        precision.as_str(),
        if options.dynamic_batch_supported { "dyn" } else { "fixed" },
        options.max_batch_size,
        optimal,
        options.max_workspace_bytes
    ))
}
