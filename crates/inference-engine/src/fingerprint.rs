//! Device capability fingerprint
//!
//! Engines are only valid on the GPU model they were optimized for, so the
//! device name goes into every artifact name.

use tracing::debug;

use crate::EngineError;

/// Name of the device at `device_index`, normalized for use in file names
pub fn device_fingerprint(device_index: u32) -> Result<String, EngineError> {
    let names = gpu_device::device_names()
        .map_err(|e| EngineError::Capability(format!("unable to enumerate CUDA devices: {}", e)))?;

    let name = names.get(device_index as usize).ok_or_else(|| {
        EngineError::Capability(format!(
            "device index {} is out of range, this host has {} CUDA-capable GPU(s)",
            device_index,
            names.len()
        ))
    })?;

    let fingerprint = sanitize_device_name(name);
    debug!("Device {} fingerprint: {}", device_index, fingerprint);
    Ok(fingerprint)
}

/// Strip whitespace and path separators from a device name
pub fn sanitize_device_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}
