//! CUDA stream with RAII cleanup

use tracing::warn;

use crate::error::{check, DeviceError};
use crate::ffi::{self, CudaStreamHandle};

/// An owned CUDA stream, destroyed on drop
#[derive(Debug)]
pub struct CudaStream {
    raw: CudaStreamHandle,
}

impl CudaStream {
    /// Create a new stream on the current device
    pub fn new() -> Result<Self, DeviceError> {
        let mut raw: CudaStreamHandle = std::ptr::null_mut();
        check("cudaStreamCreate", unsafe { ffi::cudaStreamCreate(&mut raw) })?;
        Ok(Self { raw })
    }

    /// Block until all work queued on the stream has completed
    pub fn synchronize(&self) -> Result<(), DeviceError> {
        check("cudaStreamSynchronize", unsafe { ffi::cudaStreamSynchronize(self.raw) })
    }

    /// Raw handle for passing to native libraries
    pub fn as_raw(&self) -> CudaStreamHandle {
        self.raw
    }
}

impl Drop for CudaStream {
    fn drop(&mut self) {
        let code = unsafe { ffi::cudaStreamDestroy(self.raw) };
        if code != ffi::CUDA_SUCCESS {
            warn!("cudaStreamDestroy failed with code {}", code);
        }
    }
}

// Streams may be handed to another thread; they are never shared concurrently.
unsafe impl Send for CudaStream {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_create_and_sync() {
        let stream = CudaStream::new().unwrap();
        assert!(!stream.as_raw().is_null());
        stream.synchronize().unwrap();
    }
}
