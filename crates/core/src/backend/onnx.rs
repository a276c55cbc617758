//! In-memory ONNX export of a [`Network`].
//!
//! The accelerated backend never reads a model file: it serializes the
//! resolved network to an opset-17 graph and commits the bytes directly.
//! Spatial input dimensions are symbolic so remainder tiles share the same
//! session.

use anyhow::{Context, Result};
use prost::Message;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::network::{Activation, ConvLayer, Network};

/// Generated ONNX protobuf types from `proto/onnx.proto3`.
mod onnx_proto {
    include!(concat!(env!("OUT_DIR"), "/onnx.rs"));
}

use onnx_proto::{
    attribute_proto, tensor_proto, tensor_shape_proto, type_proto, AttributeProto, GraphProto,
    ModelProto, NodeProto, OperatorSetIdProto, TensorProto, TensorShapeProto, TypeProto,
    ValueInfoProto,
};

pub const INPUT_NAME: &str = "input";
pub const OUTPUT_NAME: &str = "output";
const IR_VERSION: i64 = 8;
const OPSET_VERSION: i64 = 17;

/// Serialized model plus its content hash.
#[derive(Debug, Clone)]
pub struct ExportedModel {
    pub bytes: Vec<u8>,
    /// Hex SHA-256 of `bytes`.
    pub hash: String,
}

impl ExportedModel {
    /// Short hash used to key TensorRT engine caches.
    pub fn short_hash(&self) -> &str {
        &self.hash[..16]
    }
}

pub fn export(network: &Network) -> ExportedModel {
    let bytes = build_model(network).encode_to_vec();
    let hash = format!("{:x}", Sha256::digest(&bytes));
    ExportedModel { bytes, hash }
}

fn build_model(network: &Network) -> ModelProto {
    let mut nodes = Vec::new();
    let mut initializers = Vec::new();
    let mut current = INPUT_NAME.to_string();
    let last = network.layers().len() - 1;

    for (index, layer) in network.layers().iter().enumerate() {
        let final_value = (index == last).then_some(OUTPUT_NAME);
        current = emit_layer(layer, &current, final_value, &mut nodes, &mut initializers);
    }

    let graph = GraphProto {
        node: nodes,
        name: "dncnn".into(),
        initializer: initializers,
        input: vec![image_value_info(INPUT_NAME)],
        output: vec![image_value_info(OUTPUT_NAME)],
        ..Default::default()
    };

    ModelProto {
        ir_version: IR_VERSION,
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: OPSET_VERSION,
        }],
        producer_name: env!("CARGO_PKG_NAME").into(),
        producer_version: env!("CARGO_PKG_VERSION").into(),
        graph: Some(graph),
        ..Default::default()
    }
}

/// Append the nodes of one layer and return the name of its output value.
fn emit_layer(
    layer: &ConvLayer,
    input: &str,
    final_value: Option<&str>,
    nodes: &mut Vec<NodeProto>,
    initializers: &mut Vec<TensorProto>,
) -> String {
    let name = &layer.name;
    let mut stages: Vec<(&str, NodeProto)> = Vec::with_capacity(3);

    let weight = format!("{name}.weight");
    initializers.push(float_tensor(&weight, layer.weight.shape(), layer.weight.iter()));
    let mut conv_inputs = vec![input.to_string(), weight];
    if let Some(bias) = &layer.bias {
        let key = format!("{name}.bias");
        initializers.push(float_tensor(&key, bias.shape(), bias.iter()));
        conv_inputs.push(key);
    }
    let k = layer.kernel_size() as i64;
    let p = layer.pad() as i64;
    stages.push((
        "conv",
        NodeProto {
            input: conv_inputs,
            op_type: "Conv".into(),
            attribute: vec![
                ints_attr("kernel_shape", vec![k, k]),
                ints_attr("pads", vec![p, p, p, p]),
                ints_attr("strides", vec![1, 1]),
                ints_attr("dilations", vec![1, 1]),
            ],
            ..Default::default()
        },
    ));

    if let Some(bn) = &layer.batch_norm {
        let mut bn_inputs = Vec::with_capacity(4);
        for (suffix, values) in [
            ("weight", &bn.gamma),
            ("bias", &bn.beta),
            ("running_mean", &bn.running_mean),
            ("running_var", &bn.running_var),
        ] {
            let key = format!("{name}.bn.{suffix}");
            initializers.push(float_tensor(&key, values.shape(), values.iter()));
            bn_inputs.push(key);
        }
        stages.push((
            "bn",
            NodeProto {
                input: bn_inputs,
                op_type: "BatchNormalization".into(),
                attribute: vec![float_attr("epsilon", bn.epsilon)],
                ..Default::default()
            },
        ));
    }

    if let Some(activation) = layer.activation {
        let node = match activation {
            Activation::Relu => NodeProto {
                op_type: "Relu".into(),
                ..Default::default()
            },
            Activation::LeakyRelu(slope) => NodeProto {
                op_type: "LeakyRelu".into(),
                attribute: vec![float_attr("alpha", slope)],
                ..Default::default()
            },
        };
        stages.push(("act", node));
    }

    // Chain the stages: each consumes the previous output as its first input.
    let count = stages.len();
    let mut previous = input.to_string();
    for (position, (stage, mut node)) in stages.into_iter().enumerate() {
        let output = match final_value {
            Some(final_name) if position + 1 == count => final_name.to_string(),
            _ => format!("{name}.{stage}"),
        };
        if node.input.is_empty() {
            node.input.push(previous.clone());
        } else {
            node.input[0] = previous.clone();
        }
        node.name = format!("{name}.{stage}");
        node.output = vec![output.clone()];
        nodes.push(node);
        previous = output;
    }
    previous
}

fn float_tensor<'a>(
    name: &str,
    shape: &[usize],
    values: impl Iterator<Item = &'a f32>,
) -> TensorProto {
    TensorProto {
        dims: shape.iter().map(|&d| d as i64).collect(),
        data_type: tensor_proto::DataType::Float as i32,
        name: name.into(),
        raw_data: values.flat_map(|v| v.to_le_bytes()).collect(),
        ..Default::default()
    }
}

fn ints_attr(name: &str, ints: Vec<i64>) -> AttributeProto {
    AttributeProto {
        name: name.into(),
        r#type: attribute_proto::AttributeType::Ints as i32,
        ints,
        ..Default::default()
    }
}

fn float_attr(name: &str, f: f32) -> AttributeProto {
    AttributeProto {
        name: name.into(),
        r#type: attribute_proto::AttributeType::Float as i32,
        f,
        ..Default::default()
    }
}

/// `[1, 1, height, width]` float tensor with symbolic spatial dims.
fn image_value_info(name: &str) -> ValueInfoProto {
    let fixed = |v: i64| tensor_shape_proto::Dimension {
        value: Some(tensor_shape_proto::dimension::Value::DimValue(v)),
        ..Default::default()
    };
    let symbolic = |p: &str| tensor_shape_proto::Dimension {
        value: Some(tensor_shape_proto::dimension::Value::DimParam(p.into())),
        ..Default::default()
    };
    ValueInfoProto {
        name: name.into(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: tensor_proto::DataType::Float as i32,
                shape: Some(TensorShapeProto {
                    dim: vec![fixed(1), fixed(1), symbolic("height"), symbolic("width")],
                }),
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Operator-level view of an exported model, printed by `inspect`.
#[derive(Debug, Clone, Serialize)]
pub struct GraphSummary {
    pub opset_version: i64,
    pub op_types: Vec<String>,
    pub initializer_count: usize,
    /// Sum of all initializer element counts.
    pub param_count: u64,
}

pub fn summarize(bytes: &[u8]) -> Result<GraphSummary> {
    let model = ModelProto::decode(bytes).context("failed to decode ONNX protobuf")?;
    let opset_version = model
        .opset_import
        .iter()
        .filter(|op| op.domain.is_empty())
        .map(|op| op.version)
        .max()
        .unwrap_or(0);
    let graph = model.graph.as_ref().context("ONNX model has no graph")?;
    Ok(GraphSummary {
        opset_version,
        op_types: graph.node.iter().map(|n| n.op_type.clone()).collect(),
        initializer_count: graph.initializer.len(),
        param_count: graph
            .initializer
            .iter()
            .map(|t| t.dims.iter().map(|&d| d.max(1) as u64).product::<u64>())
            .sum(),
    })
}
