//! Execution backends
//!
//! A backend is the vendor engine the [`Engine`](crate::Engine) drives: it
//! parses ONNX into a network definition, optimizes that into a serialized
//! plan, deserializes plans, and executes them on device memory.
//!
//! - `TensorRtBackend` (feature `tensorrt`): NVIDIA TensorRT through the C++
//!   shim in `csrc/`.
//! - `ReferenceBackend` (default): `tract` on the host-emulated device.

use std::sync::Arc;

use gpu_device::{CudaStream, DevicePtr};
use serde::{Deserialize, Serialize};

use crate::logger::Logger;
use crate::options::Precision;
use crate::EngineError;

#[cfg(not(feature = "tensorrt"))]
mod reference;
#[cfg(feature = "tensorrt")]
mod tensorrt;
#[cfg(feature = "tensorrt")]
mod trt_ffi;

#[cfg(not(feature = "tensorrt"))]
pub use reference::ReferenceBackend;
#[cfg(feature = "tensorrt")]
pub use tensorrt::TensorRtBackend;

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Float,
    Half,
    Int8,
    Int32,
    Bool,
}

impl DataType {
    /// Size of one element in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::Float | DataType::Int32 => 4,
            DataType::Half => 2,
            DataType::Int8 | DataType::Bool => 1,
        }
    }
}

/// Direction of a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindingDirection {
    Input,
    Output,
}

/// Named tensor of a network, batch dimension first.
///
/// Dynamic dimensions are `-1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub name: String,
    pub data_type: DataType,
    pub dims: Vec<i64>,
}

impl TensorDesc {
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Batch dimension, `None` when dynamic
    pub fn batch_dim(&self) -> Option<usize> {
        self.dims.first().filter(|d| **d > 0).map(|d| *d as usize)
    }

    /// Elements of one batch item, `None` unless every non-batch dimension is
    /// static and positive
    pub fn elements_per_item(&self) -> Option<usize> {
        self.dims
            .iter()
            .skip(1)
            .try_fold(1usize, |acc, d| if *d > 0 { Some(acc * *d as usize) } else { None })
    }
}

/// One input or output slot of a compiled engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Position in the address array handed to [`ExecutionContext::enqueue`]
    pub index: usize,
    pub name: String,
    pub direction: BindingDirection,
    pub data_type: DataType,
    /// Shape with `-1` for the dynamic batch dimension
    pub dims: Vec<i64>,
    pub elements_per_item: usize,
}

impl Binding {
    /// Build a binding from a tensor description, rejecting shapes whose
    /// per-item size is not static
    pub fn from_desc(
        index: usize,
        direction: BindingDirection,
        desc: &TensorDesc,
    ) -> Result<Self, EngineError> {
        let elements_per_item = desc.elements_per_item().ok_or_else(|| {
            EngineError::Artifact(format!(
                "binding {} has non-static per-item shape {:?}",
                desc.name, desc.dims
            ))
        })?;
        Ok(Self {
            index,
            name: desc.name.clone(),
            direction,
            data_type: desc.data_type,
            dims: desc.dims.clone(),
            elements_per_item,
        })
    }

    pub fn is_input(&self) -> bool {
        self.direction == BindingDirection::Input
    }
}

/// Batch range the optimizer tunes for, with its preferred point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizationProfile {
    pub min: u32,
    pub opt: u32,
    pub max: u32,
}

impl OptimizationProfile {
    pub fn contains(&self, batch_size: usize) -> bool {
        batch_size >= self.min as usize && batch_size <= self.max as usize
    }
}

/// Index of the profile covering `batch_size` whose optimal point is closest
/// to it; ties go to the earlier profile
pub fn nearest_profile(profiles: &[OptimizationProfile], batch_size: usize) -> Option<usize> {
    profiles
        .iter()
        .enumerate()
        .filter(|(_, p)| p.contains(batch_size))
        .min_by_key(|(_, p)| (p.opt as i64 - batch_size as i64).abs())
        .map(|(index, _)| index)
}

/// Everything the optimizer needs besides the network itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    pub precision: Precision,
    pub max_workspace_bytes: u64,
    pub profiles: Vec<OptimizationProfile>,
    pub device_index: u32,
    pub device_fingerprint: String,
}

/// Vendor engine: parsing, optimization, and deserialization
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the device runs half precision natively. Diagnostics from the
    /// query go to `logger`.
    fn supports_fast_fp16(&self, device_index: u32, logger: Arc<dyn Logger>) -> bool;

    /// Parse an ONNX model into a network definition
    fn parse_network(
        &self,
        model: &[u8],
        logger: Arc<dyn Logger>,
    ) -> Result<Box<dyn NetworkDefinition>, EngineError>;

    /// Turn a serialized plan back into an executable engine on `device_index`
    fn deserialize(
        &self,
        plan: &[u8],
        device_index: u32,
        logger: Arc<dyn Logger>,
    ) -> Result<Box<dyn CompiledGraph>, EngineError>;
}

/// Parsed, not yet optimized network
pub trait NetworkDefinition {
    fn inputs(&self) -> &[TensorDesc];
    fn outputs(&self) -> &[TensorDesc];

    /// Run the optimizer and return the serialized plan
    fn build_serialized(&self, config: &BuildConfig) -> Result<Vec<u8>, EngineError>;
}

/// Optimized engine, ready to execute
pub trait CompiledGraph: Send {
    /// Inputs and outputs in address order
    fn bindings(&self) -> &[Binding];

    fn create_context(&self) -> Result<Box<dyn ExecutionContext>, EngineError>;
}

/// Mutable execution state of a compiled engine
pub trait ExecutionContext: Send {
    /// Fix the batch dimension of the input for the next enqueue
    fn set_batch_size(&mut self, batch_size: usize) -> Result<(), EngineError>;

    /// Queue execution with one device address per binding
    fn enqueue(&mut self, addresses: &[DevicePtr], stream: &CudaStream) -> Result<(), EngineError>;
}

/// Backend matching the crate's build: TensorRT with the `tensorrt`
/// feature, the tract reference executor otherwise
pub fn default_backend() -> Arc<dyn Backend> {
    #[cfg(feature = "tensorrt")]
    {
        Arc::new(TensorRtBackend::new())
    }
    #[cfg(not(feature = "tensorrt"))]
    {
        Arc::new(ReferenceBackend::new())
    }
}
