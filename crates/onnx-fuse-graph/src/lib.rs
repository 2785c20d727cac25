//! Host graph adapter: an owned, mutable operator graph with named tensor edges,
//! plus ONNX model import.
pub mod dtype;
pub mod graph;
pub mod node;
pub mod onnx;
pub mod tensor;

pub use dtype::{DType, DTypeError, DTypeOfPrimitive};
pub use graph::{CONSTANT_OP, Graph, GraphError};
pub use node::{Attribute, Node, NodeId};
pub use onnx::ONNXDecodingError;
pub use tensor::{ConstTensor, Dimension, TensorError, TensorInfo, checked_byte_len};
