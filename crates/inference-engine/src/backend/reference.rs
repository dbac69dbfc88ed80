//! Reference backend: `tract` on the host-emulated device
//!
//! Plans are a `postcard` container holding the ONNX bytes plus everything the
//! build decided (device, precision, profiles, IO description). Execution
//! plans are compiled per concrete batch size: the optimal sizes up front when
//! a context is created, any other size the first time it is requested.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use gpu_device::{copy_from_host_async, copy_to_host_async, CudaStream, DevicePtr};
use serde::{Deserialize, Serialize};
use tract_onnx::prelude::*;
use tracing::debug;

use super::{
    nearest_profile, Backend, Binding, BindingDirection, BuildConfig, CompiledGraph, DataType,
    ExecutionContext, NetworkDefinition, OptimizationProfile, TensorDesc,
};
use crate::fingerprint;
use crate::logger::{Logger, Severity};
use crate::options::Precision;
use crate::EngineError;

const PLAN_MAGIC: [u8; 8] = *b"VIREFPLN";
const PLAN_FORMAT_VERSION: u32 = 1;

type Plan = TypedRunnableModel<TypedModel>;

#[derive(Debug, Serialize, Deserialize)]
struct PlanFile {
    magic: [u8; 8],
    format_version: u32,
    device_fingerprint: String,
    precision: Precision,
    profiles: Vec<OptimizationProfile>,
    input: TensorDesc,
    outputs: Vec<TensorDesc>,
    model: Vec<u8>,
}

/// Executes ONNX graphs with `tract` on host memory
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceBackend;

impl ReferenceBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for ReferenceBackend {
    fn name(&self) -> &'static str {
        "tract-reference"
    }

    fn supports_fast_fp16(&self, _device_index: u32, _logger: Arc<dyn Logger>) -> bool {
        false
    }

    fn parse_network(
        &self,
        model: &[u8],
        logger: Arc<dyn Logger>,
    ) -> Result<Box<dyn NetworkDefinition>, EngineError> {
        let graph = read_onnx(model)
            .map_err(|e| EngineError::Model(format!("failed to parse ONNX model: {}", e)))?;
        let typed = graph
            .clone()
            .into_typed()
            .map_err(|e| EngineError::Model(format!("unsupported graph: {}", e)))?;

        let describe_all = |outlets: &[OutletId]| -> Result<Vec<TensorDesc>, EngineError> {
            outlets.iter().map(|o| describe(&typed, *o)).collect()
        };
        let inputs = describe_all(typed.input_outlets().map_err(model_err)?)?;
        let outputs = describe_all(typed.output_outlets().map_err(model_err)?)?;
        debug!("Parsed ONNX graph: {} input(s), {} output(s)", inputs.len(), outputs.len());

        Ok(Box::new(ReferenceNetwork {
            model: model.to_vec(),
            graph,
            inputs,
            outputs,
            logger,
        }))
    }

    fn deserialize(
        &self,
        plan: &[u8],
        device_index: u32,
        logger: Arc<dyn Logger>,
    ) -> Result<Box<dyn CompiledGraph>, EngineError> {
        let plan: PlanFile = postcard::from_bytes(plan)
            .map_err(|e| EngineError::Artifact(format!("unreadable engine plan: {}", e)))?;
        if plan.magic != PLAN_MAGIC {
            return Err(EngineError::Artifact("not a reference engine plan".to_string()));
        }
        if plan.format_version != PLAN_FORMAT_VERSION {
            return Err(EngineError::Artifact(format!(
                "plan format version {} is not supported (expected {})",
                plan.format_version, PLAN_FORMAT_VERSION
            )));
        }
        let device = fingerprint::device_fingerprint(device_index)?;
        if plan.device_fingerprint != device {
            return Err(EngineError::Artifact(format!(
                "plan was built for {}, this device is {}",
                plan.device_fingerprint, device
            )));
        }

        let graph = read_onnx(&plan.model)
            .map_err(|e| EngineError::Artifact(format!("embedded model is corrupt: {}", e)))?;
        let item_shape = item_shape(&plan.input).ok_or_else(|| {
            EngineError::Artifact(format!("plan input has invalid shape {:?}", plan.input.dims))
        })?;

        let mut bindings = vec![Binding::from_desc(0, BindingDirection::Input, &plan.input)?];
        for (i, output) in plan.outputs.iter().enumerate() {
            bindings.push(Binding::from_desc(i + 1, BindingDirection::Output, output)?);
        }
        logger.log(
            Severity::Verbose,
            &format!(
                "deserialized {} plan with {} binding(s)",
                plan.precision.as_str(),
                bindings.len()
            ),
        );

        Ok(Box::new(ReferenceGraph {
            graph: Arc::new(graph),
            item_shape,
            profiles: plan.profiles,
            bindings,
        }))
    }
}

struct ReferenceNetwork {
    model: Vec<u8>,
    graph: InferenceModel,
    inputs: Vec<TensorDesc>,
    outputs: Vec<TensorDesc>,
    logger: Arc<dyn Logger>,
}

impl NetworkDefinition for ReferenceNetwork {
    fn inputs(&self) -> &[TensorDesc] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorDesc] {
        &self.outputs
    }

    fn build_serialized(&self, config: &BuildConfig) -> Result<Vec<u8>, EngineError> {
        let mut input = self
            .inputs
            .first()
            .cloned()
            .ok_or_else(|| EngineError::Build("network has no input".to_string()))?;
        let shape = item_shape(&input).ok_or_else(|| {
            EngineError::Build(format!("input {} has invalid shape {:?}", input.name, input.dims))
        })?;

        for profile in &config.profiles {
            self.logger.log(
                Severity::Verbose,
                &format!("optimizing {} for batch {}", input.name, profile.opt),
            );
            compile(&self.graph, profile.opt as usize, shape).map_err(|e| {
                EngineError::Build(format!(
                    "optimization for batch size {} failed: {}",
                    profile.opt, e
                ))
            })?;
        }

        // A single degenerate profile pins the batch dimension
        if let [only] = config.profiles.as_slice() {
            if only.min == only.max {
                input.dims[0] = only.max as i64;
            }
        }

        let plan = PlanFile {
            magic: PLAN_MAGIC,
            format_version: PLAN_FORMAT_VERSION,
            device_fingerprint: config.device_fingerprint.clone(),
            precision: config.precision,
            profiles: config.profiles.clone(),
            input,
            outputs: self.outputs.clone(),
            model: self.model.clone(),
        };
        postcard::to_allocvec(&plan)
            .map_err(|e| EngineError::Build(format!("failed to serialize plan: {}", e)))
    }
}

struct ReferenceGraph {
    graph: Arc<InferenceModel>,
    item_shape: [usize; 3],
    profiles: Vec<OptimizationProfile>,
    bindings: Vec<Binding>,
}

impl CompiledGraph for ReferenceGraph {
    fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    fn create_context(&self) -> Result<Box<dyn ExecutionContext>, EngineError> {
        let mut plans = HashMap::new();
        for profile in &self.profiles {
            let batch = profile.opt as usize;
            if plans.contains_key(&batch) {
                continue;
            }
            let plan = compile(&self.graph, batch, self.item_shape).map_err(|e| {
                EngineError::Artifact(format!("plan does not compile for batch {}: {}", batch, e))
            })?;
            plans.insert(batch, plan);
        }

        Ok(Box::new(ReferenceContext {
            graph: Arc::clone(&self.graph),
            item_shape: self.item_shape,
            profiles: self.profiles.clone(),
            outputs: self.bindings.iter().filter(|b| !b.is_input()).cloned().collect(),
            plans,
            batch_size: None,
        }))
    }
}

struct ReferenceContext {
    graph: Arc<InferenceModel>,
    item_shape: [usize; 3],
    profiles: Vec<OptimizationProfile>,
    outputs: Vec<Binding>,
    plans: HashMap<usize, Plan>,
    batch_size: Option<usize>,
}

impl ExecutionContext for ReferenceContext {
    fn set_batch_size(&mut self, batch_size: usize) -> Result<(), EngineError> {
        if nearest_profile(&self.profiles, batch_size).is_none() {
            return Err(EngineError::Configuration(format!(
                "batch size {} is outside every optimization profile",
                batch_size
            )));
        }
        if !self.plans.contains_key(&batch_size) {
            debug!("Compiling execution plan for batch size {}", batch_size);
            let plan = compile(&self.graph, batch_size, self.item_shape).map_err(|e| {
                EngineError::Runtime(format!(
                    "failed to compile batch size {}: {}",
                    batch_size, e
                ))
            })?;
            self.plans.insert(batch_size, plan);
        }
        self.batch_size = Some(batch_size);
        Ok(())
    }

    fn enqueue(&mut self, addresses: &[DevicePtr], stream: &CudaStream) -> Result<(), EngineError> {
        let batch = self
            .batch_size
            .ok_or_else(|| EngineError::Runtime("input batch size was not set".to_string()))?;
        if addresses.len() != self.outputs.len() + 1 {
            return Err(EngineError::Runtime(format!(
                "expected {} binding addresses, got {}",
                self.outputs.len() + 1,
                addresses.len()
            )));
        }
        let plan = self
            .plans
            .get(&batch)
            .ok_or_else(|| EngineError::Runtime(format!("no plan for batch size {}", batch)))?;

        let [c, h, w] = self.item_shape;
        let mut input = vec![0f32; batch * c * h * w];
        unsafe { copy_to_host_async(addresses[0], &mut input, stream)? };
        stream.synchronize()?;

        let tensor = Tensor::from_shape(&[batch, c, h, w], &input).map_err(runtime_err)?;
        let results = plan.run(tvec!(tensor.into())).map_err(runtime_err)?;
        if results.len() != self.outputs.len() {
            return Err(EngineError::Runtime(format!(
                "graph produced {} outputs, engine has {} output bindings",
                results.len(),
                self.outputs.len()
            )));
        }

        let outputs = self.outputs.iter().zip(results.iter()).zip(&addresses[1..]);
        for ((binding, value), address) in outputs {
            let values = value.as_slice::<f32>().map_err(|e| {
                EngineError::Runtime(format!("output {} is not float: {}", binding.name, e))
            })?;
            let expected = binding.elements_per_item * batch;
            if values.len() != expected {
                return Err(EngineError::Runtime(format!(
                    "output {} has {} values, expected {}",
                    binding.name,
                    values.len(),
                    expected
                )));
            }
            unsafe { copy_from_host_async(*address, values, stream)? };
        }
        // Host-side results must outlive the queued copies
        stream.synchronize()?;
        Ok(())
    }
}

fn read_onnx(bytes: &[u8]) -> TractResult<InferenceModel> {
    tract_onnx::onnx().model_for_read(&mut Cursor::new(bytes))
}

fn compile(graph: &InferenceModel, batch: usize, [c, h, w]: [usize; 3]) -> TractResult<Plan> {
    graph
        .clone()
        .with_input_fact(0, f32::fact([batch, c, h, w]).into())?
        .into_optimized()?
        .into_runnable()
}

fn describe(model: &TypedModel, outlet: OutletId) -> Result<TensorDesc, EngineError> {
    let fact = model.outlet_fact(outlet).map_err(model_err)?;
    let name = model
        .outlet_label(outlet)
        .map(str::to_string)
        .unwrap_or_else(|| model.node(outlet.node).name.clone());
    let data_type = match fact.datum_type {
        DatumType::F32 => DataType::Float,
        DatumType::F16 => DataType::Half,
        DatumType::I8 => DataType::Int8,
        DatumType::I32 => DataType::Int32,
        DatumType::Bool => DataType::Bool,
        other => {
            return Err(EngineError::Model(format!(
                "tensor {} has unsupported element type {:?}",
                name, other
            )))
        }
    };
    let dims = fact.shape.iter().map(|d| d.to_i64().unwrap_or(-1)).collect();
    Ok(TensorDesc { name, data_type, dims })
}

/// `[C, H, W]` of a rank-4 input with static item dimensions
fn item_shape(input: &TensorDesc) -> Option<[usize; 3]> {
    match input.dims.as_slice() {
        [_, c, h, w] if *c > 0 && *h > 0 && *w > 0 => Some([*c as usize, *h as usize, *w as usize]),
        _ => None,
    }
}

fn model_err(e: TractError) -> EngineError {
    EngineError::Model(e.to_string())
}

fn runtime_err(e: TractError) -> EngineError {
    EngineError::Runtime(e.to_string())
}
