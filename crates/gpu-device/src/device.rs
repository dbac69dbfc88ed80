//! Device enumeration and selection

use libc::{c_char, c_int};
use std::ffi::CStr;
use tracing::debug;

use crate::error::{check, DeviceError};
use crate::ffi;

const NAME_CAPACITY: usize = 256;

/// Free/total memory of the current device, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub free: usize,
    pub total: usize,
}

/// Number of CUDA-capable devices on this host
pub fn device_count() -> Result<u32, DeviceError> {
    let mut count: c_int = 0;
    let code = unsafe { ffi::cudaGetDeviceCount(&mut count) };
    if code == ffi::CUDA_ERROR_NO_DEVICE {
        return Ok(0);
    }
    check("cudaGetDeviceCount", code)?;
    Ok(count.max(0) as u32)
}

/// Name of the device at `index`, as reported by the driver
pub fn device_name(index: u32) -> Result<String, DeviceError> {
    let count = device_count()?;
    if index >= count {
        return Err(DeviceError::InvalidDevice { index, count });
    }

    let mut buf = [0 as c_char; NAME_CAPACITY];
    let code = unsafe { ffi::vi_cuda_device_name(index as c_int, buf.as_mut_ptr(), buf.len()) };
    check("cudaGetDeviceProperties", code)?;

    let name = unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    Ok(name)
}

/// Names of all installed devices, ordered by index
pub fn device_names() -> Result<Vec<String>, DeviceError> {
    let count = device_count()?;
    let names = (0..count).map(device_name).collect::<Result<Vec<_>, _>>()?;
    debug!("Enumerated {} CUDA device(s): {:?}", names.len(), names);
    Ok(names)
}

/// Make `index` the current device for the calling thread
pub fn set_device(index: u32) -> Result<(), DeviceError> {
    let code = unsafe { ffi::cudaSetDevice(index as c_int) };
    if code == ffi::CUDA_SUCCESS {
        return Ok(());
    }
    let count = device_count().unwrap_or(0);
    if code == ffi::CUDA_ERROR_INVALID_DEVICE || index >= count {
        return Err(DeviceError::InvalidDevice { index, count });
    }
    check("cudaSetDevice", code)
}

/// Memory usage of the current device
pub fn memory_info() -> Result<MemoryInfo, DeviceError> {
    let mut free = 0usize;
    let mut total = 0usize;
    check("cudaMemGetInfo", unsafe { ffi::cudaMemGetInfo(&mut free, &mut total) })?;
    Ok(MemoryInfo { free, total })
}

#[cfg(all(test, not(feature = "cuda")))]
mod tests {
    use super::*;

    #[test]
    fn test_emulated_device_is_enumerated() {
        assert_eq!(device_count().unwrap(), 1);
        assert_eq!(device_names().unwrap(), vec![ffi::EMULATED_DEVICE_NAME.to_string()]);
    }

    #[test]
    fn test_out_of_range_name_reports_count() {
        match device_name(3) {
            Err(DeviceError::InvalidDevice { index, count }) => {
                assert_eq!(index, 3);
                assert_eq!(count, 1);
            }
            other => panic!("expected InvalidDevice, got {:?}", other),
        }
    }

    #[test]
    fn test_set_device() {
        assert!(set_device(0).is_ok());
        let err = set_device(2).unwrap_err();
        assert!(err.to_string().contains("1 CUDA-capable GPU(s)"));
    }

    #[test]
    fn test_memory_info_is_consistent() {
        let info = memory_info().unwrap();
        assert!(info.free <= info.total);
    }
}
