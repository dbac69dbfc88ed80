//! Engine artifact files

use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::EngineError;

/// Write `bytes` to `path` so that readers see either no file or the
/// complete one. The temporary file lives next to the target and is removed
/// if anything fails before the rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), EngineError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| {
        EngineError::Artifact(format!("cannot create cache directory {}: {}", dir.display(), e))
    })?;

    let mut file = NamedTempFile::new_in(dir).map_err(|e| {
        EngineError::Artifact(format!("cannot create temporary file in {}: {}", dir.display(), e))
    })?;
    file.write_all(bytes)
        .and_then(|_| file.as_file().sync_all())
        .map_err(|e| EngineError::Artifact(format!("failed to write engine plan: {}", e)))?;
    file.persist(path).map_err(|e| {
        EngineError::Artifact(format!("failed to save engine to {}: {}", path.display(), e.error))
    })?;

    debug!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

/// Read a complete artifact into memory
pub(crate) fn read_artifact(path: &Path) -> Result<Vec<u8>, EngineError> {
    let bytes = fs::read(path).map_err(|e| {
        EngineError::Artifact(format!("unable to read engine file {}: {}", path.display(), e))
    })?;
    if bytes.is_empty() {
        return Err(EngineError::Artifact(format!("engine file {} is empty", path.display())));
    }
    Ok(bytes)
}
