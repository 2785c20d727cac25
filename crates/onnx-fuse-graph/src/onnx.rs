//! Decoding of the subset of the ONNX protobuf schema the compiler consumes.
//!
//! Messages are declared with `prost` derives directly; field tags follow
//! `onnx.proto3`.
use crate::dtype::{DType, DTypeError};
use crate::graph::{Graph, GraphError};
use crate::node::{Attribute, Node};
use crate::tensor::{ConstTensor, Dimension, TensorError, TensorInfo};
use prost::Message;
use std::path::Path;

#[derive(Clone, PartialEq, Message)]
pub struct ModelProto {
    #[prost(int64, tag = "1")]
    pub ir_version: i64,
    #[prost(message, repeated, tag = "8")]
    pub opset_import: Vec<OperatorSetIdProto>,
    #[prost(string, tag = "2")]
    pub producer_name: String,
    #[prost(message, optional, tag = "7")]
    pub graph: Option<GraphProto>,
    #[prost(message, repeated, tag = "14")]
    pub metadata_props: Vec<StringStringEntryProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct OperatorSetIdProto {
    #[prost(string, tag = "1")]
    pub domain: String,
    #[prost(int64, tag = "2")]
    pub version: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct StringStringEntryProto {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct GraphProto {
    #[prost(message, repeated, tag = "1")]
    pub node: Vec<NodeProto>,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(message, repeated, tag = "5")]
    pub initializer: Vec<TensorProto>,
    #[prost(message, repeated, tag = "11")]
    pub input: Vec<ValueInfoProto>,
    #[prost(message, repeated, tag = "12")]
    pub output: Vec<ValueInfoProto>,
    #[prost(message, repeated, tag = "13")]
    pub value_info: Vec<ValueInfoProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct NodeProto {
    #[prost(string, repeated, tag = "1")]
    pub input: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub output: Vec<String>,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub op_type: String,
    #[prost(string, tag = "7")]
    pub domain: String,
    #[prost(message, repeated, tag = "5")]
    pub attribute: Vec<AttributeProto>,
}

pub mod attribute_type {
    pub const FLOAT: i32 = 1;
    pub const INT: i32 = 2;
    pub const STRING: i32 = 3;
    pub const TENSOR: i32 = 4;
    pub const FLOATS: i32 = 6;
    pub const INTS: i32 = 7;
    pub const STRINGS: i32 = 8;
}

#[derive(Clone, PartialEq, Message)]
pub struct AttributeProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int32, tag = "20")]
    pub r#type: i32,
    #[prost(float, tag = "2")]
    pub f: f32,
    #[prost(int64, tag = "3")]
    pub i: i64,
    #[prost(bytes = "vec", tag = "4")]
    pub s: Vec<u8>,
    #[prost(message, optional, tag = "5")]
    pub t: Option<TensorProto>,
    #[prost(float, repeated, tag = "7")]
    pub floats: Vec<f32>,
    #[prost(int64, repeated, tag = "8")]
    pub ints: Vec<i64>,
    #[prost(bytes = "vec", repeated, tag = "9")]
    pub strings: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorProto {
    #[prost(int64, repeated, tag = "1")]
    pub dims: Vec<i64>,
    #[prost(int32, tag = "2")]
    pub data_type: i32,
    #[prost(float, repeated, tag = "4")]
    pub float_data: Vec<f32>,
    #[prost(int32, repeated, tag = "5")]
    pub int32_data: Vec<i32>,
    #[prost(int64, repeated, tag = "7")]
    pub int64_data: Vec<i64>,
    #[prost(string, tag = "8")]
    pub name: String,
    #[prost(bytes = "vec", tag = "9")]
    pub raw_data: Vec<u8>,
    #[prost(double, repeated, tag = "10")]
    pub double_data: Vec<f64>,
    #[prost(uint64, repeated, tag = "11")]
    pub uint64_data: Vec<u64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ValueInfoProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub r#type: Option<TypeProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TypeProto {
    #[prost(oneof = "type_proto::Value", tags = "1")]
    pub value: Option<type_proto::Value>,
}

pub mod type_proto {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Tensor {
        #[prost(int32, tag = "1")]
        pub elem_type: i32,
        #[prost(message, optional, tag = "2")]
        pub shape: Option<super::TensorShapeProto>,
    }

    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Value {
        #[prost(message, tag = "1")]
        TensorType(Tensor),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorShapeProto {
    #[prost(message, repeated, tag = "1")]
    pub dim: Vec<tensor_shape_proto::Dimension>,
}

pub mod tensor_shape_proto {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Dimension {
        #[prost(oneof = "dimension::Value", tags = "1, 2")]
        pub value: Option<dimension::Value>,
    }

    pub mod dimension {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Value {
            #[prost(int64, tag = "1")]
            DimValue(i64),
            #[prost(string, tag = "2")]
            DimParam(String),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ONNXDecodingError {
    #[error("Protobuf decoding error")]
    ProtobufDecodeError(#[from] prost::DecodeError),
    #[error("Unable to read model file")]
    Io(#[from] std::io::Error),
    #[error("Missing field \"{0}\"")]
    MissingField(&'static str),
    #[error("Negative dimension in \"{0}\"")]
    NegativeDimensionError(String),
    #[error("Unsupported ONNX: {0}")]
    UnsupportedONNX(String),
    #[error(transparent)]
    DTypeError(#[from] DTypeError),
    #[error(transparent)]
    TensorError(#[from] TensorError),
    #[error(transparent)]
    GraphError(#[from] GraphError),
}

impl TryFrom<&TensorProto> for ConstTensor {
    type Error = ONNXDecodingError;

    fn try_from(tensor: &TensorProto) -> Result<Self, Self::Error> {
        let dtype = DType::from_onnx_code(tensor.data_type)?;
        let mut shape = Vec::with_capacity(tensor.dims.len());
        for d in &tensor.dims {
            if *d < 0 {
                return Err(ONNXDecodingError::NegativeDimensionError(tensor.name.clone()));
            }
            shape.push(*d as usize);
        }

        let numel: usize = shape.iter().product();
        let out = if !tensor.raw_data.is_empty() {
            ConstTensor::new(dtype, shape, tensor.raw_data.clone())?
        } else if !tensor.float_data.is_empty() && dtype == DType::F32 {
            ConstTensor::from_vec(tensor.float_data.clone(), shape)?
        } else if !tensor.double_data.is_empty() && dtype == DType::F64 {
            ConstTensor::from_vec(tensor.double_data.clone(), shape)?
        } else if !tensor.int64_data.is_empty() && dtype == DType::I64 {
            ConstTensor::from_vec(tensor.int64_data.clone(), shape)?
        } else if !tensor.uint64_data.is_empty() {
            match dtype {
                DType::U64 => ConstTensor::from_vec(tensor.uint64_data.clone(), shape)?,
                DType::U32 => ConstTensor::from_vec(tensor.uint64_data.iter().map(|x| *x as u32).collect::<Vec<_>>(), shape)?,
                _ => Err(ONNXDecodingError::UnsupportedONNX(format!("{dtype} in uint64_data")))?,
            }
        } else if !tensor.int32_data.is_empty() {
            let d = &tensor.int32_data;
            match dtype {
                DType::I32 => ConstTensor::from_vec(d.clone(), shape)?,
                DType::I16 => ConstTensor::from_vec(d.iter().map(|x| *x as i16).collect::<Vec<_>>(), shape)?,
                DType::U16 => ConstTensor::from_vec(d.iter().map(|x| *x as u16).collect::<Vec<_>>(), shape)?,
                DType::I8 => ConstTensor::from_vec(d.iter().map(|x| *x as i8).collect::<Vec<_>>(), shape)?,
                DType::U8 => ConstTensor::from_vec(d.iter().map(|x| *x as u8).collect::<Vec<_>>(), shape)?,
                DType::BOOL => ConstTensor::from_vec(d.iter().map(|x| *x != 0).collect::<Vec<_>>(), shape)?,
                DType::F16 | DType::BF16 => {
                    // 16-bit floats travel as their bit patterns.
                    let mut raw = Vec::with_capacity(d.len() * 2);
                    for x in d {
                        raw.extend_from_slice(&(*x as u16).to_le_bytes());
                    }
                    ConstTensor::new(dtype, shape, raw)?
                }
                _ => Err(ONNXDecodingError::UnsupportedONNX(format!("{dtype} in int32_data")))?,
            }
        } else if numel == 0 {
            ConstTensor::new(dtype, shape, vec![])?
        } else {
            Err(ONNXDecodingError::UnsupportedONNX(format!(
                "tensor \"{}\" has no inline data",
                tensor.name
            )))?
        };
        Ok(out)
    }
}

fn value_info_to_tensor_info(value_info: &ValueInfoProto) -> Result<TensorInfo, ONNXDecodingError> {
    let Some(type_proto) = &value_info.r#type else {
        return Ok(TensorInfo::unknown());
    };
    let Some(type_proto::Value::TensorType(tensor_type)) = &type_proto.value else {
        return Err(ONNXDecodingError::UnsupportedONNX(format!(
            "non-tensor value \"{}\"",
            value_info.name
        )));
    };
    let dtype = if tensor_type.elem_type == 0 {
        None
    } else {
        Some(DType::from_onnx_code(tensor_type.elem_type)?)
    };
    let shape = match &tensor_type.shape {
        Some(shape) => {
            let mut dims = Vec::with_capacity(shape.dim.len());
            for (i, dim) in shape.dim.iter().enumerate() {
                use tensor_shape_proto::dimension::Value;
                dims.push(match &dim.value {
                    Some(Value::DimValue(x)) if *x >= 0 => Dimension::Known(*x as usize),
                    Some(Value::DimValue(_)) => {
                        return Err(ONNXDecodingError::NegativeDimensionError(value_info.name.clone()));
                    }
                    Some(Value::DimParam(x)) => Dimension::Unknown(x.clone()),
                    None => Dimension::Unknown(format!("{}_{i}", value_info.name)),
                });
            }
            Some(dims)
        }
        None => None,
    };
    Ok(TensorInfo { dtype, shape })
}

fn attribute_from_onnx(attr: &AttributeProto) -> Result<Option<Attribute>, ONNXDecodingError> {
    Ok(Some(match attr.r#type {
        attribute_type::FLOAT => Attribute::Float(attr.f),
        attribute_type::INT => Attribute::Int(attr.i),
        attribute_type::STRING => Attribute::String(String::from_utf8_lossy(&attr.s).into_owned()),
        attribute_type::TENSOR => {
            let t = attr.t.as_ref().ok_or(ONNXDecodingError::MissingField("attribute.t"))?;
            Attribute::Tensor(ConstTensor::try_from(t)?)
        }
        attribute_type::FLOATS => Attribute::Floats(attr.floats.clone()),
        attribute_type::INTS => Attribute::Ints(attr.ints.clone()),
        attribute_type::STRINGS => Attribute::Strings(
            attr.strings
                .iter()
                .map(|x| String::from_utf8_lossy(x).into_owned())
                .collect(),
        ),
        other => {
            log::debug!("Skipping attribute \"{}\" of unsupported type {}", attr.name, other);
            return Ok(None);
        }
    }))
}

impl Graph {
    pub fn from_onnx_bytes(onnx_bytes: &[u8]) -> Result<Self, ONNXDecodingError> {
        let model = ModelProto::decode(onnx_bytes)?;
        Self::from_onnx_model_proto(&model)
    }

    pub fn from_onnx_file(path: &Path) -> Result<Self, ONNXDecodingError> {
        let bytes = std::fs::read(path)?;
        let mut graph = Self::from_onnx_bytes(&bytes)?;
        graph.set_source_path(path);
        Ok(graph)
    }

    pub fn from_onnx_model_proto(model: &ModelProto) -> Result<Self, ONNXDecodingError> {
        let onnx_graph = model.graph.as_ref().ok_or(ONNXDecodingError::MissingField("graph"))?;
        let mut graph = Graph::new(&onnx_graph.name);
        for entry in &model.metadata_props {
            graph.set_metadata(&entry.key, &entry.value);
        }

        let initializer_names: Vec<&str> = onnx_graph.initializer.iter().map(|x| x.name.as_str()).collect();
        for t in &onnx_graph.initializer {
            graph.add_initializer(&t.name, ConstTensor::try_from(t)?)?;
        }
        for input in &onnx_graph.input {
            // Older exporters list initializers as graph inputs too.
            if initializer_names.contains(&input.name.as_str()) {
                continue;
            }
            graph.add_input(&input.name, value_info_to_tensor_info(input)?)?;
        }
        for onnx_node in &onnx_graph.node {
            // Node names are not required to be unique in ONNX; generate one on collision.
            let name = if graph.find_node(&onnx_node.name).is_some() {
                ""
            } else {
                onnx_node.name.as_str()
            };
            let mut node = Node::new(&onnx_node.op_type)
                .named(name)
                .in_domain(&onnx_node.domain)
                .with_inputs(&onnx_node.input)
                .with_outputs(&onnx_node.output);
            for attr in &onnx_node.attribute {
                if let Some(value) = attribute_from_onnx(attr)? {
                    node.attributes.insert(attr.name.clone(), value);
                }
            }
            graph.add_node(node)?;
        }
        for value_info in onnx_graph.value_info.iter().chain(onnx_graph.output.iter()) {
            graph.set_tensor_info(&value_info.name, value_info_to_tensor_info(value_info)?);
        }
        for output in &onnx_graph.output {
            graph.add_output(&output.name);
        }
        Ok(graph)
    }
}
