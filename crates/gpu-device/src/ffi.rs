//! FFI bindings for the CUDA runtime
//!
//! With the `cuda` feature the functions below resolve to `libcudart` and the
//! helper library compiled from `csrc/`. Without it, a host emulation with the
//! same signatures stands in: "device" memory is ordinary host memory, a
//! single emulated device is reported, and the preprocessing kernel runs on
//! the CPU. Everything above this module is written against one API.

#![allow(non_snake_case)]

use libc::{c_char, c_int, c_void, size_t};

/// `cudaStream_t`
pub type CudaStreamHandle = *mut c_void;

/// `cudaError_t` values this crate distinguishes
pub const CUDA_SUCCESS: c_int = 0;
pub const CUDA_ERROR_INVALID_VALUE: c_int = 1;
pub const CUDA_ERROR_MEMORY_ALLOCATION: c_int = 2;
pub const CUDA_ERROR_NO_DEVICE: c_int = 100;
pub const CUDA_ERROR_INVALID_DEVICE: c_int = 101;

/// `cudaMemcpyKind`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CudaMemcpyKind {
    HostToHost = 0,
    HostToDevice = 1,
    DeviceToHost = 2,
    DeviceToDevice = 3,
}

#[cfg(feature = "cuda")]
#[link(name = "cudart")]
extern "C" {
    pub fn cudaGetDeviceCount(count: *mut c_int) -> c_int;
    pub fn cudaSetDevice(device: c_int) -> c_int;
    pub fn cudaMemGetInfo(free: *mut size_t, total: *mut size_t) -> c_int;
    pub fn cudaMalloc(ptr: *mut *mut c_void, size: size_t) -> c_int;
    pub fn cudaFree(ptr: *mut c_void) -> c_int;
    pub fn cudaMemcpy(
        dst: *mut c_void,
        src: *const c_void,
        count: size_t,
        kind: CudaMemcpyKind,
    ) -> c_int;
    pub fn cudaMemcpyAsync(
        dst: *mut c_void,
        src: *const c_void,
        count: size_t,
        kind: CudaMemcpyKind,
        stream: CudaStreamHandle,
    ) -> c_int;
    pub fn cudaStreamCreate(stream: *mut CudaStreamHandle) -> c_int;
    pub fn cudaStreamSynchronize(stream: CudaStreamHandle) -> c_int;
    pub fn cudaStreamDestroy(stream: CudaStreamHandle) -> c_int;
    pub fn cudaGetErrorString(code: c_int) -> *const c_char;
}

// Helper library built from csrc/vi_cuda.cu
#[cfg(feature = "cuda")]
extern "C" {
    pub fn vi_cuda_device_name(device: c_int, out: *mut c_char, out_len: size_t) -> c_int;
    pub fn vi_cuda_preprocess_u8c3(
        src: *const u8,
        src_w: c_int,
        src_h: c_int,
        src_pitch: size_t,
        dst: *mut f32,
        dst_w: c_int,
        dst_h: c_int,
        sub: *const f32,
        div: *const f32,
        stream: CudaStreamHandle,
    ) -> c_int;
}

#[cfg(not(feature = "cuda"))]
pub use host_emulation::*;

#[cfg(not(feature = "cuda"))]
pub(crate) mod host_emulation {
    use super::*;
    use crate::preprocess::{preprocess_interleaved, Normalization};
    use parking_lot::Mutex;
    use std::alloc::{self, Layout};
    use std::cell::Cell;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicI32, Ordering};

    /// Name reported for the single emulated device
    pub const EMULATED_DEVICE_NAME: &str = "Host Emulated Device";

    const ALIGNMENT: usize = 256;

    static ALLOCATIONS: Mutex<BTreeMap<usize, Layout>> = parking_lot::const_mutex(BTreeMap::new());
    static CURRENT_DEVICE: AtomicI32 = AtomicI32::new(0);

    thread_local! {
        static LIVE_ON_THREAD: Cell<usize> = const { Cell::new(0) };
    }

    /// Emulated allocations made by the calling thread that are still alive
    pub fn live_allocations() -> usize {
        LIVE_ON_THREAD.with(|c| c.get())
    }

    pub unsafe fn cudaGetDeviceCount(count: *mut c_int) -> c_int {
        *count = 1;
        CUDA_SUCCESS
    }

    pub unsafe fn cudaSetDevice(device: c_int) -> c_int {
        if device != 0 {
            return CUDA_ERROR_INVALID_DEVICE;
        }
        CURRENT_DEVICE.store(device, Ordering::SeqCst);
        CUDA_SUCCESS
    }

    pub unsafe fn cudaMemGetInfo(free: *mut size_t, total: *mut size_t) -> c_int {
        let in_use: usize = ALLOCATIONS.lock().values().map(|l| l.size()).sum();
        let capacity: usize = 8 << 30;
        *total = capacity;
        *free = capacity.saturating_sub(in_use);
        CUDA_SUCCESS
    }

    pub unsafe fn cudaMalloc(ptr: *mut *mut c_void, size: size_t) -> c_int {
        if size == 0 {
            *ptr = std::ptr::null_mut();
            return CUDA_SUCCESS;
        }
        let layout = match Layout::from_size_align(size, ALIGNMENT) {
            Ok(l) => l,
            Err(_) => return CUDA_ERROR_MEMORY_ALLOCATION,
        };
        let raw = alloc::alloc_zeroed(layout);
        if raw.is_null() {
            return CUDA_ERROR_MEMORY_ALLOCATION;
        }
        ALLOCATIONS.lock().insert(raw as usize, layout);
        LIVE_ON_THREAD.with(|c| c.set(c.get() + 1));
        *ptr = raw as *mut c_void;
        CUDA_SUCCESS
    }

    pub unsafe fn cudaFree(ptr: *mut c_void) -> c_int {
        if ptr.is_null() {
            return CUDA_SUCCESS;
        }
        let layout = match ALLOCATIONS.lock().remove(&(ptr as usize)) {
            Some(l) => l,
            None => return CUDA_ERROR_INVALID_VALUE,
        };
        alloc::dealloc(ptr as *mut u8, layout);
        LIVE_ON_THREAD.with(|c| c.set(c.get().saturating_sub(1)));
        CUDA_SUCCESS
    }

    pub unsafe fn cudaMemcpy(
        dst: *mut c_void,
        src: *const c_void,
        count: size_t,
        _kind: CudaMemcpyKind,
    ) -> c_int {
        if count == 0 {
            return CUDA_SUCCESS;
        }
        if dst.is_null() || src.is_null() {
            return CUDA_ERROR_INVALID_VALUE;
        }
        std::ptr::copy(src as *const u8, dst as *mut u8, count);
        CUDA_SUCCESS
    }

    pub unsafe fn cudaMemcpyAsync(
        dst: *mut c_void,
        src: *const c_void,
        count: size_t,
        kind: CudaMemcpyKind,
        _stream: CudaStreamHandle,
    ) -> c_int {
        cudaMemcpy(dst, src, count, kind)
    }

    pub unsafe fn cudaStreamCreate(stream: *mut CudaStreamHandle) -> c_int {
        *stream = Box::into_raw(Box::new(0u64)) as CudaStreamHandle;
        CUDA_SUCCESS
    }

    pub unsafe fn cudaStreamSynchronize(_stream: CudaStreamHandle) -> c_int {
        // Emulated work completes synchronously
        CUDA_SUCCESS
    }

    pub unsafe fn cudaStreamDestroy(stream: CudaStreamHandle) -> c_int {
        if !stream.is_null() {
            drop(Box::from_raw(stream as *mut u64));
        }
        CUDA_SUCCESS
    }

    pub unsafe fn cudaGetErrorString(code: c_int) -> *const c_char {
        let msg: &'static [u8] = match code {
            CUDA_SUCCESS => b"no error\0",
            CUDA_ERROR_INVALID_VALUE => b"invalid argument\0",
            CUDA_ERROR_MEMORY_ALLOCATION => b"out of memory\0",
            CUDA_ERROR_NO_DEVICE => b"no CUDA-capable device is detected\0",
            CUDA_ERROR_INVALID_DEVICE => b"invalid device ordinal\0",
            _ => b"unknown error\0",
        };
        msg.as_ptr() as *const c_char
    }

    pub unsafe fn vi_cuda_device_name(device: c_int, out: *mut c_char, out_len: size_t) -> c_int {
        if device != 0 {
            return CUDA_ERROR_INVALID_DEVICE;
        }
        if out_len == 0 {
            return CUDA_ERROR_INVALID_VALUE;
        }
        let name = EMULATED_DEVICE_NAME.as_bytes();
        let n = name.len().min(out_len - 1);
        std::ptr::copy_nonoverlapping(name.as_ptr(), out as *mut u8, n);
        *out.add(n) = 0;
        CUDA_SUCCESS
    }

    pub unsafe fn vi_cuda_preprocess_u8c3(
        src: *const u8,
        src_w: c_int,
        src_h: c_int,
        src_pitch: size_t,
        dst: *mut f32,
        dst_w: c_int,
        dst_h: c_int,
        sub: *const f32,
        div: *const f32,
        _stream: CudaStreamHandle,
    ) -> c_int {
        if src_w <= 0 || src_h <= 0 || dst_w <= 0 || dst_h <= 0 || src.is_null() || dst.is_null() {
            return CUDA_ERROR_INVALID_VALUE;
        }
        let (sw, sh, dw, dh) = (src_w as usize, src_h as usize, dst_w as usize, dst_h as usize);
        let src = std::slice::from_raw_parts(src, src_pitch * (sh - 1) + sw * 3);
        let dst = std::slice::from_raw_parts_mut(dst, 3 * dw * dh);
        let norm = Normalization {
            subtract: [*sub, *sub.add(1), *sub.add(2)],
            divide: [*div, *div.add(1), *div.add(2)],
        };
        preprocess_interleaved(src, sw, sh, src_pitch, dst, dw, dh, &norm);
        CUDA_SUCCESS
    }
}
