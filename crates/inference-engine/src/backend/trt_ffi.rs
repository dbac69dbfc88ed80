//! FFI declarations for `csrc/trt_shim.cpp`

use libc::{c_char, c_int, c_void, size_t};

pub const VI_TRT_MAX_DIMS: usize = 8;
pub const VI_TRT_MAX_NAME: usize = 256;

/// `nvinfer1::DataType`
pub const TRT_FLOAT: c_int = 0;
pub const TRT_HALF: c_int = 1;
pub const TRT_INT8: c_int = 2;
pub const TRT_INT32: c_int = 3;
pub const TRT_BOOL: c_int = 4;

pub type ViLogFn = extern "C" fn(user: *mut c_void, severity: c_int, message: *const c_char);

#[repr(C)]
pub struct ViNetwork {
    _private: [u8; 0],
}

#[repr(C)]
pub struct ViEngine {
    _private: [u8; 0],
}

#[repr(C)]
pub struct ViContext {
    _private: [u8; 0],
}

#[repr(C)]
pub struct ViTensorDesc {
    pub name: [c_char; VI_TRT_MAX_NAME],
    pub data_type: c_int,
    pub nb_dims: c_int,
    pub dims: [i64; VI_TRT_MAX_DIMS],
    pub is_input: c_int,
}

impl Default for ViTensorDesc {
    fn default() -> Self {
        Self {
            name: [0; VI_TRT_MAX_NAME],
            data_type: 0,
            nb_dims: 0,
            dims: [0; VI_TRT_MAX_DIMS],
            is_input: 0,
        }
    }
}

#[repr(C)]
pub struct ViProfile {
    pub min: c_int,
    pub opt: c_int,
    pub max: c_int,
}

#[repr(C)]
pub struct ViBuildConfig {
    pub fp16: c_int,
    pub max_workspace_bytes: u64,
    pub profiles: *const ViProfile,
    pub num_profiles: size_t,
}

extern "C" {
    pub fn vi_trt_platform_has_fast_fp16(device: c_int, log: ViLogFn, user: *mut c_void) -> c_int;

    pub fn vi_trt_parse_onnx(
        data: *const u8,
        len: size_t,
        log: ViLogFn,
        user: *mut c_void,
    ) -> *mut ViNetwork;
    pub fn vi_trt_network_num_tensors(network: *const ViNetwork, is_input: c_int) -> c_int;
    pub fn vi_trt_network_tensor(
        network: *const ViNetwork,
        is_input: c_int,
        index: c_int,
        out: *mut ViTensorDesc,
    ) -> c_int;
    pub fn vi_trt_build_serialized(
        network: *mut ViNetwork,
        config: *const ViBuildConfig,
        out_data: *mut *mut u8,
        out_len: *mut size_t,
    ) -> c_int;
    pub fn vi_trt_free_blob(data: *mut u8);
    pub fn vi_trt_network_destroy(network: *mut ViNetwork);

    pub fn vi_trt_deserialize(
        data: *const u8,
        len: size_t,
        device: c_int,
        log: ViLogFn,
        user: *mut c_void,
    ) -> *mut ViEngine;
    pub fn vi_trt_engine_num_io(engine: *const ViEngine) -> c_int;
    pub fn vi_trt_engine_io(engine: *const ViEngine, index: c_int, out: *mut ViTensorDesc) -> c_int;
    pub fn vi_trt_engine_num_profiles(engine: *const ViEngine) -> c_int;
    pub fn vi_trt_engine_profile(
        engine: *const ViEngine,
        name: *const c_char,
        index: c_int,
        out: *mut ViProfile,
    ) -> c_int;
    pub fn vi_trt_engine_destroy(engine: *mut ViEngine);

    pub fn vi_trt_context_create(engine: *mut ViEngine) -> *mut ViContext;
    pub fn vi_trt_context_set_input_batch(
        context: *mut ViContext,
        name: *const c_char,
        profile: c_int,
        batch: c_int,
        stream: *mut c_void,
    ) -> c_int;
    pub fn vi_trt_context_enqueue(
        context: *mut ViContext,
        addresses: *const *mut c_void,
        count: size_t,
        stream: *mut c_void,
    ) -> c_int;
    pub fn vi_trt_context_destroy(context: *mut ViContext);
}
