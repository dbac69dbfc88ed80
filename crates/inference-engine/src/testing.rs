//! Test fixtures: tiny ONNX models, a capturing logger, backend wrappers

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use prost::Message;
use tract_onnx::pb::tensor_shape_proto::{dimension, Dimension};
use tract_onnx::pb::{
    tensor_proto, type_proto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto,
    TensorShapeProto, TypeProto, ValueInfoProto,
};

use crate::backend::{
    default_backend, Backend, BuildConfig, CompiledGraph, NetworkDefinition, TensorDesc,
};
use crate::logger::{Logger, Severity};
use crate::EngineError;

const IR_VERSION: i64 = 7;
const OPSET: i64 = 13;

enum Dim {
    Value(i64),
    Param(&'static str),
}

/// Float tensor value; `None` leaves the shape to inference
fn value_info(name: &str, dims: Option<&[Dim]>) -> ValueInfoProto {
    let shape = dims.map(|dims| TensorShapeProto {
        dim: dims
            .iter()
            .map(|d| Dimension {
                value: Some(match d {
                    Dim::Value(v) => dimension::Value::DimValue(*v),
                    Dim::Param(p) => dimension::Value::DimParam(p.to_string()),
                }),
                ..Default::default()
            })
            .collect(),
    });
    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: tensor_proto::DataType::Float as i32,
                shape,
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn node(op: &str, name: &str, inputs: &[&str], outputs: &[&str]) -> NodeProto {
    NodeProto {
        input: inputs.iter().map(|s| s.to_string()).collect(),
        output: outputs.iter().map(|s| s.to_string()).collect(),
        name: name.to_string(),
        op_type: op.to_string(),
        ..Default::default()
    }
}

fn model(
    nodes: Vec<NodeProto>,
    inputs: Vec<ValueInfoProto>,
    outputs: Vec<ValueInfoProto>,
) -> Vec<u8> {
    ModelProto {
        ir_version: IR_VERSION,
        producer_name: "vision-infer-tests".to_string(),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: OPSET,
        }],
        graph: Some(GraphProto {
            node: nodes,
            name: "test-graph".to_string(),
            input: inputs,
            output: outputs,
            ..Default::default()
        }),
        ..Default::default()
    }
    .encode_to_vec()
}

fn image_dims(channels: u32, height: u32, width: u32) -> [Dim; 4] {
    [
        Dim::Param("N"),
        Dim::Value(channels as i64),
        Dim::Value(height as i64),
        Dim::Value(width as i64),
    ]
}

/// Input `images: [N, channels, height, width]`; outputs `mean` and `max`,
/// each `[N, channels]`, the per-channel global average and maximum
pub(crate) fn pooling_model(channels: u32, height: u32, width: u32) -> Vec<u8> {
    let input_dims = image_dims(channels, height, width);
    model(
        vec![
            node("GlobalAveragePool", "gap", &["images"], &["gap_out"]),
            node("Flatten", "mean", &["gap_out"], &["mean"]),
            node("GlobalMaxPool", "gmp", &["images"], &["gmp_out"]),
            node("Flatten", "max", &["gmp_out"], &["max"]),
        ],
        vec![value_info("images", Some(&input_dims[..]))],
        vec![value_info("mean", None), value_info("max", None)],
    )
}

/// Two inputs summed before pooling
pub(crate) fn two_input_model(channels: u32, height: u32, width: u32) -> Vec<u8> {
    let dims = image_dims(channels, height, width);
    model(
        vec![
            node("Add", "add", &["a", "b"], &["sum"]),
            node("GlobalAveragePool", "gap", &["sum"], &["gap_out"]),
            node("Flatten", "mean", &["gap_out"], &["mean"]),
        ],
        vec![value_info("a", Some(&dims[..])), value_info("b", Some(&dims[..]))],
        vec![value_info("mean", None)],
    )
}

/// Sequence input `[N, channels, length]`
pub(crate) fn rank3_model(channels: u32, length: u32) -> Vec<u8> {
    let dims = [Dim::Param("N"), Dim::Value(channels as i64), Dim::Value(length as i64)];
    model(
        vec![
            node("GlobalAveragePool", "gap", &["seq"], &["gap_out"]),
            node("Flatten", "mean", &["gap_out"], &["mean"]),
        ],
        vec![value_info("seq", Some(&dims[..]))],
        vec![value_info("mean", None)],
    )
}

pub(crate) fn write_model(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, bytes).unwrap();
    path
}

/// Engine artifacts present in `dir`
pub(crate) fn artifacts_in(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.contains(".engine."))
        .collect()
}

/// Keeps every message it receives
#[derive(Default)]
pub(crate) struct CapturingLogger {
    messages: Mutex<Vec<(Severity, String)>>,
}

impl CapturingLogger {
    pub(crate) fn messages_at(&self, severity: Severity) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|(s, _)| *s == severity)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl Logger for CapturingLogger {
    fn log(&self, severity: Severity, message: &str) {
        self.messages.lock().push((severity, message.to_string()));
    }
}

/// Default backend that counts `parse_network` calls
pub(crate) struct CountingBackend {
    inner: Arc<dyn Backend>,
    parses: AtomicUsize,
}

impl Default for CountingBackend {
    fn default() -> Self {
        Self {
            inner: default_backend(),
            parses: AtomicUsize::new(0),
        }
    }
}

impl CountingBackend {
    pub(crate) fn parse_calls(&self) -> usize {
        self.parses.load(Ordering::SeqCst)
    }
}

impl Backend for CountingBackend {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn supports_fast_fp16(&self, device_index: u32, logger: Arc<dyn Logger>) -> bool {
        self.inner.supports_fast_fp16(device_index, logger)
    }

    fn parse_network(
        &self,
        model: &[u8],
        logger: Arc<dyn Logger>,
    ) -> Result<Box<dyn NetworkDefinition>, EngineError> {
        self.parses.fetch_add(1, Ordering::SeqCst);
        self.inner.parse_network(model, logger)
    }

    fn deserialize(
        &self,
        plan: &[u8],
        device_index: u32,
        logger: Arc<dyn Logger>,
    ) -> Result<Box<dyn CompiledGraph>, EngineError> {
        self.inner.deserialize(plan, device_index, logger)
    }
}

/// Default backend that claims native half precision
pub(crate) struct Fp16Backend {
    inner: Arc<dyn Backend>,
}

impl Default for Fp16Backend {
    fn default() -> Self {
        Self {
            inner: default_backend(),
        }
    }
}

impl Backend for Fp16Backend {
    fn name(&self) -> &'static str {
        "fp16"
    }

    fn supports_fast_fp16(&self, _device_index: u32, logger: Arc<dyn Logger>) -> bool {
        logger.log(Severity::Info, "platform reports fast fp16");
        true
    }

    fn parse_network(
        &self,
        model: &[u8],
        logger: Arc<dyn Logger>,
    ) -> Result<Box<dyn NetworkDefinition>, EngineError> {
        self.inner.parse_network(model, logger)
    }

    fn deserialize(
        &self,
        plan: &[u8],
        device_index: u32,
        logger: Arc<dyn Logger>,
    ) -> Result<Box<dyn CompiledGraph>, EngineError> {
        self.inner.deserialize(plan, device_index, logger)
    }
}

/// Default backend whose optimizer always fails
pub(crate) struct FailingBuildBackend {
    inner: Arc<dyn Backend>,
}

impl Default for FailingBuildBackend {
    fn default() -> Self {
        Self {
            inner: default_backend(),
        }
    }
}

struct FailingNetwork(Box<dyn NetworkDefinition>);

impl NetworkDefinition for FailingNetwork {
    fn inputs(&self) -> &[TensorDesc] {
        self.0.inputs()
    }

    fn outputs(&self) -> &[TensorDesc] {
        self.0.outputs()
    }

    fn build_serialized(&self, _config: &BuildConfig) -> Result<Vec<u8>, EngineError> {
        Err(EngineError::Build("optimizer ran out of tactics".to_string()))
    }
}

impl Backend for FailingBuildBackend {
    fn name(&self) -> &'static str {
        "failing-build"
    }

    fn supports_fast_fp16(&self, device_index: u32, logger: Arc<dyn Logger>) -> bool {
        self.inner.supports_fast_fp16(device_index, logger)
    }

    fn parse_network(
        &self,
        model: &[u8],
        logger: Arc<dyn Logger>,
    ) -> Result<Box<dyn NetworkDefinition>, EngineError> {
        let network = self.inner.parse_network(model, logger)?;
        Ok(Box::new(FailingNetwork(network)))
    }

    fn deserialize(
        &self,
        plan: &[u8],
        device_index: u32,
        logger: Arc<dyn Logger>,
    ) -> Result<Box<dyn CompiledGraph>, EngineError> {
        self.inner.deserialize(plan, device_index, logger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pooling_model_decodes() {
        let bytes = pooling_model(3, 4, 4);
        let decoded = ModelProto::decode(bytes.as_slice()).unwrap();
        let graph = decoded.graph.unwrap();
        assert_eq!(graph.input.len(), 1);
        assert_eq!(graph.input[0].name, "images");
        let ops: Vec<_> = graph.node.iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(ops, ["GlobalAveragePool", "Flatten", "GlobalMaxPool", "Flatten"]);
        assert_eq!(decoded.opset_import[0].version, OPSET);
    }

    #[test]
    fn test_fixtures_parse_with_default_backend() {
        let logger: Arc<dyn Logger> = Arc::new(CapturingLogger::default());
        let network = default_backend().parse_network(&pooling_model(3, 4, 4), logger).unwrap();
        assert_eq!(network.inputs()[0].dims, vec![-1, 3, 4, 4]);
        assert_eq!(network.outputs().len(), 2);
    }
}
