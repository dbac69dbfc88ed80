//! TensorRT backend
//!
//! Thin RAII layer over the C shim. TensorRT log messages go to the engine's
//! diagnostics sink through `forward_log`.

use std::ffi::{CStr, CString};
use std::sync::Arc;

use gpu_device::{CudaStream, DevicePtr};
use libc::{c_char, c_int, c_void};
use tracing::debug;

use super::trt_ffi::{
    self, ViBuildConfig, ViContext, ViEngine, ViNetwork, ViProfile, ViTensorDesc,
};
use super::{
    nearest_profile, Backend, Binding, BindingDirection, BuildConfig, CompiledGraph, DataType,
    ExecutionContext, NetworkDefinition, OptimizationProfile, TensorDesc,
};
use crate::logger::{Logger, Severity};
use crate::options::Precision;
use crate::EngineError;

/// Keeps a logger at a stable address for the native side
struct LogSink(Box<Arc<dyn Logger>>);

impl LogSink {
    fn new(logger: Arc<dyn Logger>) -> Self {
        Self(Box::new(logger))
    }

    fn user(&self) -> *mut c_void {
        &*self.0 as *const Arc<dyn Logger> as *mut c_void
    }
}

extern "C" fn forward_log(user: *mut c_void, severity: c_int, message: *const c_char) {
    if user.is_null() || message.is_null() {
        return;
    }
    let logger = unsafe { &*(user as *const Arc<dyn Logger>) };
    let message = unsafe { CStr::from_ptr(message) }.to_string_lossy();
    logger.log(Severity::from_raw(severity), &message);
}

fn data_type(raw: c_int) -> Option<DataType> {
    match raw {
        trt_ffi::TRT_FLOAT => Some(DataType::Float),
        trt_ffi::TRT_HALF => Some(DataType::Half),
        trt_ffi::TRT_INT8 => Some(DataType::Int8),
        trt_ffi::TRT_INT32 => Some(DataType::Int32),
        trt_ffi::TRT_BOOL => Some(DataType::Bool),
        _ => None,
    }
}

fn tensor_desc(raw: &ViTensorDesc) -> Result<TensorDesc, String> {
    let name = unsafe { CStr::from_ptr(raw.name.as_ptr()) }.to_string_lossy().into_owned();
    let data_type = data_type(raw.data_type).ok_or_else(|| {
        format!("tensor {} has unsupported TensorRT data type {}", name, raw.data_type)
    })?;
    let rank = (raw.nb_dims.max(0) as usize).min(trt_ffi::VI_TRT_MAX_DIMS);
    Ok(TensorDesc {
        name,
        data_type,
        dims: raw.dims[..rank].to_vec(),
    })
}

/// NVIDIA TensorRT through the C++ shim
#[derive(Debug, Default, Clone, Copy)]
pub struct TensorRtBackend;

impl TensorRtBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for TensorRtBackend {
    fn name(&self) -> &'static str {
        "tensorrt"
    }

    fn supports_fast_fp16(&self, device_index: u32, logger: Arc<dyn Logger>) -> bool {
        let sink = LogSink::new(logger);
        let fast = unsafe {
            trt_ffi::vi_trt_platform_has_fast_fp16(device_index as c_int, forward_log, sink.user())
        };
        fast != 0
    }

    fn parse_network(
        &self,
        model: &[u8],
        logger: Arc<dyn Logger>,
    ) -> Result<Box<dyn NetworkDefinition>, EngineError> {
        let sink = LogSink::new(logger);
        let raw = unsafe {
            trt_ffi::vi_trt_parse_onnx(model.as_ptr(), model.len(), forward_log, sink.user())
        };
        if raw.is_null() {
            return Err(EngineError::Model(
                "TensorRT could not parse the ONNX model, see parser diagnostics".to_string(),
            ));
        }
        let mut network = TensorRtNetwork {
            raw,
            _sink: sink,
            inputs: Vec::new(),
            outputs: Vec::new(),
        };
        network.inputs = network.read_tensors(true)?;
        network.outputs = network.read_tensors(false)?;
        Ok(Box::new(network))
    }

    fn deserialize(
        &self,
        plan: &[u8],
        device_index: u32,
        logger: Arc<dyn Logger>,
    ) -> Result<Box<dyn CompiledGraph>, EngineError> {
        let sink = LogSink::new(logger);
        let raw = unsafe {
            trt_ffi::vi_trt_deserialize(
                plan.as_ptr(),
                plan.len(),
                device_index as c_int,
                forward_log,
                sink.user(),
            )
        };
        if raw.is_null() {
            return Err(EngineError::Artifact(concat!(
                "TensorRT could not deserialize the engine plan ",
                "(corrupt, or built by another TensorRT version)"
            )
            .to_string()));
        }
        let engine = Arc::new(EngineHandle { raw, _sink: sink });

        let count = unsafe { trt_ffi::vi_trt_engine_num_io(engine.raw) }.max(0) as usize;
        let mut bindings = Vec::with_capacity(count);
        let mut input_name = None;
        for index in 0..count {
            let mut raw_desc = ViTensorDesc::default();
            let code =
                unsafe { trt_ffi::vi_trt_engine_io(engine.raw, index as c_int, &mut raw_desc) };
            if code != 0 {
                return Err(EngineError::Artifact(format!(
                    "failed to read engine binding {}",
                    index
                )));
            }
            let desc = tensor_desc(&raw_desc).map_err(EngineError::Artifact)?;
            let direction = if raw_desc.is_input != 0 {
                BindingDirection::Input
            } else {
                BindingDirection::Output
            };
            if direction == BindingDirection::Input && input_name.is_none() {
                input_name = Some(desc.name.clone());
            }
            bindings.push(Binding::from_desc(index, direction, &desc)?);
        }

        let input_name = input_name
            .ok_or_else(|| EngineError::Artifact("engine has no input binding".to_string()))?;
        let input_name = CString::new(input_name)
            .map_err(|e| EngineError::Artifact(format!("invalid input binding name: {}", e)))?;
        let profiles = read_profiles(&engine, &input_name)?;
        debug!(
            "Deserialized TensorRT engine with {} binding(s), {} profile(s)",
            bindings.len(),
            profiles.len()
        );

        Ok(Box::new(TensorRtGraph {
            engine,
            bindings,
            input_name,
            profiles,
        }))
    }
}

fn read_profiles(
    engine: &EngineHandle,
    input_name: &CString,
) -> Result<Vec<OptimizationProfile>, EngineError> {
    let count = unsafe { trt_ffi::vi_trt_engine_num_profiles(engine.raw) }.max(0);
    (0..count)
        .map(|index| {
            let mut raw = ViProfile { min: 0, opt: 0, max: 0 };
            let code = unsafe {
                trt_ffi::vi_trt_engine_profile(engine.raw, input_name.as_ptr(), index, &mut raw)
            };
            if code != 0 {
                return Err(EngineError::Artifact(format!(
                    "failed to read optimization profile {}",
                    index
                )));
            }
            Ok(OptimizationProfile {
                min: raw.min as u32,
                opt: raw.opt as u32,
                max: raw.max as u32,
            })
        })
        .collect()
}

struct TensorRtNetwork {
    raw: *mut ViNetwork,
    _sink: LogSink,
    inputs: Vec<TensorDesc>,
    outputs: Vec<TensorDesc>,
}

impl TensorRtNetwork {
    fn read_tensors(&self, is_input: bool) -> Result<Vec<TensorDesc>, EngineError> {
        let flag = is_input as c_int;
        let count = unsafe { trt_ffi::vi_trt_network_num_tensors(self.raw, flag) }.max(0);
        (0..count)
            .map(|index| {
                let mut raw = ViTensorDesc::default();
                let code =
                    unsafe { trt_ffi::vi_trt_network_tensor(self.raw, flag, index, &mut raw) };
                if code != 0 {
                    return Err(EngineError::Model(format!(
                        "failed to read network tensor {}",
                        index
                    )));
                }
                tensor_desc(&raw).map_err(EngineError::Model)
            })
            .collect()
    }
}

impl NetworkDefinition for TensorRtNetwork {
    fn inputs(&self) -> &[TensorDesc] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorDesc] {
        &self.outputs
    }

    fn build_serialized(&self, config: &BuildConfig) -> Result<Vec<u8>, EngineError> {
        let profiles: Vec<ViProfile> = config
            .profiles
            .iter()
            .map(|p| ViProfile {
                min: p.min as c_int,
                opt: p.opt as c_int,
                max: p.max as c_int,
            })
            .collect();
        let raw_config = ViBuildConfig {
            fp16: (config.precision == Precision::Fp16) as c_int,
            max_workspace_bytes: config.max_workspace_bytes,
            profiles: profiles.as_ptr(),
            num_profiles: profiles.len(),
        };

        let mut data: *mut u8 = std::ptr::null_mut();
        let mut len = 0usize;
        let code = unsafe {
            trt_ffi::vi_trt_build_serialized(self.raw, &raw_config, &mut data, &mut len)
        };
        if code != 0 || data.is_null() {
            return Err(EngineError::Build(format!("TensorRT builder failed (code {})", code)));
        }
        let plan = unsafe { std::slice::from_raw_parts(data, len) }.to_vec();
        unsafe { trt_ffi::vi_trt_free_blob(data) };
        Ok(plan)
    }
}

impl Drop for TensorRtNetwork {
    fn drop(&mut self) {
        unsafe { trt_ffi::vi_trt_network_destroy(self.raw) };
    }
}

struct EngineHandle {
    raw: *mut ViEngine,
    _sink: LogSink,
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        unsafe { trt_ffi::vi_trt_engine_destroy(self.raw) };
    }
}

// The engine is only touched from the thread that owns the Engine.
unsafe impl Send for EngineHandle {}
unsafe impl Sync for EngineHandle {}

struct TensorRtGraph {
    engine: Arc<EngineHandle>,
    bindings: Vec<Binding>,
    input_name: CString,
    profiles: Vec<OptimizationProfile>,
}

impl CompiledGraph for TensorRtGraph {
    fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    fn create_context(&self) -> Result<Box<dyn ExecutionContext>, EngineError> {
        let raw = unsafe { trt_ffi::vi_trt_context_create(self.engine.raw) };
        if raw.is_null() {
            return Err(EngineError::Artifact("failed to create execution context".to_string()));
        }
        Ok(Box::new(TensorRtContext {
            raw,
            input_name: self.input_name.clone(),
            profiles: self.profiles.clone(),
            pending: None,
            _engine: Arc::clone(&self.engine),
        }))
    }
}

struct TensorRtContext {
    raw: *mut ViContext,
    input_name: CString,
    profiles: Vec<OptimizationProfile>,
    /// (profile index, batch size) applied on the next enqueue, where the
    /// stream for the profile switch is known
    pending: Option<(usize, usize)>,
    // Keeps the engine alive until the context is gone
    _engine: Arc<EngineHandle>,
}

impl ExecutionContext for TensorRtContext {
    fn set_batch_size(&mut self, batch_size: usize) -> Result<(), EngineError> {
        let profile = nearest_profile(&self.profiles, batch_size).ok_or_else(|| {
            EngineError::Configuration(format!(
                "batch size {} is outside every optimization profile",
                batch_size
            ))
        })?;
        self.pending = Some((profile, batch_size));
        Ok(())
    }

    fn enqueue(&mut self, addresses: &[DevicePtr], stream: &CudaStream) -> Result<(), EngineError> {
        let (profile, batch_size) = self
            .pending
            .ok_or_else(|| EngineError::Runtime("input batch size was not set".to_string()))?;
        let code = unsafe {
            trt_ffi::vi_trt_context_set_input_batch(
                self.raw,
                self.input_name.as_ptr(),
                profile as c_int,
                batch_size as c_int,
                stream.as_raw(),
            )
        };
        if code != 0 {
            return Err(EngineError::Configuration(format!(
                "batch size {} rejected by optimization profile {} (code {})",
                batch_size, profile, code
            )));
        }

        let raw: Vec<*mut c_void> = addresses.iter().map(|a| a.as_raw()).collect();
        let code = unsafe {
            trt_ffi::vi_trt_context_enqueue(self.raw, raw.as_ptr(), raw.len(), stream.as_raw())
        };
        if code != 0 {
            return Err(EngineError::Runtime(format!(
                "failed to enqueue inference (code {})",
                code
            )));
        }
        Ok(())
    }
}

impl Drop for TensorRtContext {
    fn drop(&mut self) {
        unsafe { trt_ffi::vi_trt_context_destroy(self.raw) };
    }
}

unsafe impl Send for TensorRtContext {}
