//! Device memory allocations with RAII cleanup

use std::mem::size_of;

use libc::c_void;
use tracing::warn;

use crate::error::{check, DeviceError};
use crate::ffi::{self, CudaMemcpyKind};
use crate::stream::CudaStream;

/// Address in device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePtr(*mut c_void);

impl DevicePtr {
    /// The null device address
    pub fn null() -> Self {
        Self(std::ptr::null_mut())
    }

    /// Wrap a raw address obtained from a native library
    pub fn from_raw(raw: *mut c_void) -> Self {
        Self(raw)
    }

    /// Address `bytes` past this one
    pub fn offset(self, bytes: usize) -> Self {
        Self((self.0 as *mut u8).wrapping_add(bytes) as *mut c_void)
    }

    pub fn as_raw(self) -> *mut c_void {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

/// Device addresses are plain integers to the host.
unsafe impl Send for DevicePtr {}
unsafe impl Sync for DevicePtr {}

/// Owned allocation in device memory, freed on drop
#[derive(Debug)]
pub struct DeviceBuffer {
    ptr: DevicePtr,
    len: usize,
}

impl DeviceBuffer {
    /// Allocate `len` bytes on the current device
    pub fn alloc(len: usize) -> Result<Self, DeviceError> {
        let mut raw: *mut c_void = std::ptr::null_mut();
        let code = unsafe { ffi::cudaMalloc(&mut raw, len) };
        if code == ffi::CUDA_ERROR_MEMORY_ALLOCATION {
            return Err(DeviceError::OutOfMemory(len));
        }
        check("cudaMalloc", code)?;
        Ok(Self {
            ptr: DevicePtr(raw),
            len,
        })
    }

    /// Allocate a buffer holding a copy of `data`
    pub fn from_host<T: Copy>(data: &[T]) -> Result<Self, DeviceError> {
        let mut buffer = Self::alloc(std::mem::size_of_val(data))?;
        buffer.upload(data)?;
        Ok(buffer)
    }

    /// Copy `data` to the start of the buffer (synchronous)
    pub fn upload<T: Copy>(&mut self, data: &[T]) -> Result<(), DeviceError> {
        let bytes = std::mem::size_of_val(data);
        if bytes > self.len {
            return Err(DeviceError::InvalidArgument(format!(
                "upload of {} bytes into a {} byte buffer",
                bytes, self.len
            )));
        }
        if bytes == 0 {
            return Ok(());
        }
        check("cudaMemcpy", unsafe {
            ffi::cudaMemcpy(
                self.ptr.as_raw(),
                data.as_ptr() as *const c_void,
                bytes,
                CudaMemcpyKind::HostToDevice,
            )
        })
    }

    /// Copy the start of the buffer into `dst` (synchronous)
    pub fn copy_to_host<T: Copy>(&self, dst: &mut [T]) -> Result<(), DeviceError> {
        let bytes = std::mem::size_of_val(dst);
        if bytes > self.len {
            return Err(DeviceError::InvalidArgument(format!(
                "download of {} bytes from a {} byte buffer",
                bytes, self.len
            )));
        }
        if bytes == 0 {
            return Ok(());
        }
        check("cudaMemcpy", unsafe {
            ffi::cudaMemcpy(
                dst.as_mut_ptr() as *mut c_void,
                self.ptr.as_raw(),
                bytes,
                CudaMemcpyKind::DeviceToHost,
            )
        })
    }

    /// Copy the whole buffer into a new host vector of `T`
    pub fn download<T: Copy + Default>(&self) -> Result<Vec<T>, DeviceError> {
        let mut host = vec![T::default(); self.len / size_of::<T>()];
        self.copy_to_host(&mut host)?;
        Ok(host)
    }

    /// Allocate a new buffer with the same contents (device to device)
    pub fn try_clone(&self) -> Result<Self, DeviceError> {
        let copy = Self::alloc(self.len)?;
        if self.len > 0 {
            check("cudaMemcpy", unsafe {
                ffi::cudaMemcpy(
                    copy.ptr.as_raw(),
                    self.ptr.as_raw(),
                    self.len,
                    CudaMemcpyKind::DeviceToDevice,
                )
            })?;
        }
        Ok(copy)
    }

    pub fn as_ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        let code = unsafe { ffi::cudaFree(self.ptr.as_raw()) };
        if code != ffi::CUDA_SUCCESS {
            warn!("cudaFree of {} bytes failed with code {}", self.len, code);
        }
    }
}

// The allocation is exclusively owned; moving it between threads is fine.
unsafe impl Send for DeviceBuffer {}

/// Queue a device-to-host copy of `dst.len()` elements starting at `src`.
///
/// # Safety
/// `src` must point to at least `size_of_val(dst)` bytes of live device
/// memory, and `dst` must stay untouched until `stream` is synchronized.
pub unsafe fn copy_to_host_async<T: Copy>(
    src: DevicePtr,
    dst: &mut [T],
    stream: &CudaStream,
) -> Result<(), DeviceError> {
    let bytes = std::mem::size_of_val(dst);
    if bytes == 0 {
        return Ok(());
    }
    check(
        "cudaMemcpyAsync",
        ffi::cudaMemcpyAsync(
            dst.as_mut_ptr() as *mut c_void,
            src.as_raw(),
            bytes,
            CudaMemcpyKind::DeviceToHost,
            stream.as_raw(),
        ),
    )
}

/// Queue a host-to-device copy of `src` to `dst`.
///
/// # Safety
/// `dst` must point to at least `size_of_val(src)` bytes of live device
/// memory, and `src` must outlive the copy (synchronize `stream` first).
pub unsafe fn copy_from_host_async<T: Copy>(
    dst: DevicePtr,
    src: &[T],
    stream: &CudaStream,
) -> Result<(), DeviceError> {
    let bytes = std::mem::size_of_val(src);
    if bytes == 0 {
        return Ok(());
    }
    check(
        "cudaMemcpyAsync",
        ffi::cudaMemcpyAsync(
            dst.as_raw(),
            src.as_ptr() as *const c_void,
            bytes,
            CudaMemcpyKind::HostToDevice,
            stream.as_raw(),
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_download() {
        let data: Vec<f32> = (0..64).map(|i| i as f32 * 0.5).collect();
        let buffer = DeviceBuffer::from_host(&data).unwrap();
        assert_eq!(buffer.len(), 64 * 4);
        assert_eq!(buffer.download::<f32>().unwrap(), data);
    }

    #[test]
    fn test_upload_larger_than_buffer_is_rejected() {
        let mut buffer = DeviceBuffer::alloc(8).unwrap();
        let err = buffer.upload(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArgument(_)));
    }

    #[test]
    fn test_try_clone_copies_contents() {
        let original = DeviceBuffer::from_host(&[1u8, 2, 3, 4]).unwrap();
        let copy = original.try_clone().unwrap();
        assert_ne!(copy.as_ptr(), original.as_ptr());
        assert_eq!(copy.download::<u8>().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_async_copies_at_offset() {
        let stream = CudaStream::new().unwrap();
        let buffer = DeviceBuffer::alloc(4 * 8).unwrap();
        unsafe {
            copy_from_host_async(buffer.as_ptr().offset(16), &[7.0f32, 8.0], &stream).unwrap();
        }
        let mut tail = [0.0f32; 4];
        unsafe {
            copy_to_host_async(buffer.as_ptr().offset(16), &mut tail, &stream).unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(tail, [7.0, 8.0, 0.0, 0.0]);
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_drop_releases_allocation() {
        let before = crate::ffi::live_allocations();
        {
            let _a = DeviceBuffer::alloc(128).unwrap();
            let _b = DeviceBuffer::alloc(256).unwrap();
            assert_eq!(crate::ffi::live_allocations(), before + 2);
        }
        assert_eq!(crate::ffi::live_allocations(), before);
    }
}
