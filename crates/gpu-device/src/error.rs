//! Device error types

use std::ffi::CStr;

use libc::c_int;
use thiserror::Error;

use crate::ffi;

/// Errors raised by the CUDA runtime layer
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    /// A CUDA runtime call returned a non-success code
    #[error("{call} failed with CUDA error {code}: {message}")]
    Cuda {
        call: &'static str,
        code: i32,
        message: String,
    },

    /// Device ordinal outside the installed devices
    #[error("Invalid device index {index}: this host has {count} CUDA-capable GPU(s)")]
    InvalidDevice { index: u32, count: u32 },

    /// Allocation refused by the device
    #[error("Out of device memory while allocating {0} bytes")]
    OutOfMemory(usize),

    /// Caller-side misuse (sizes, dimensions)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Map a `cudaError_t` to a `Result`
pub(crate) fn check(call: &'static str, code: c_int) -> Result<(), DeviceError> {
    if code == ffi::CUDA_SUCCESS {
        return Ok(());
    }
    Err(DeviceError::Cuda {
        call,
        code,
        message: error_string(code),
    })
}

/// Human readable text for a CUDA error code
pub fn error_string(code: c_int) -> String {
    unsafe {
        let ptr = ffi::cudaGetErrorString(code);
        if ptr.is_null() {
            "unknown error".to_string()
        } else {
            CStr::from_ptr(ptr).to_string_lossy().into_owned()
        }
    }
}
