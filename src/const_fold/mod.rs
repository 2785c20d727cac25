//! Compile-time evaluation of nodes whose inputs are all literal.
//!
//! A node is eligible when it has an evaluator, a single output, and every
//! present input is literal with a static shape (shape-only operators need just
//! the static shape). Evaluation failures are soft: the node is left as is.
mod arithmetic;
mod layout;
mod quantize;
mod typed;

pub use quantize::FIX_NEURON_DOMAIN;
pub use typed::{FoldArgs, TypedArray, from_array, from_iter, to_array};
pub(crate) use typed::with_typed_array;

use crate::context::{CONST_DATA_ATTR, CompilationContext, ContextError};
use crate::node_builder::NodeBuilder;
use crate::pass::PassError;
use crate::pattern::OpKey;
use onnx_fuse_graph::{Attribute, CONSTANT_OP, ConstTensor, DType, Graph, NodeId, TensorError};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum FoldError {
    #[error("No evaluator for {0}")]
    Unsupported(OpKey),
    #[error("Node has {0} outputs, only single-output nodes fold")]
    MultiOutput(usize),
    #[error("Input {0} is not literal")]
    NonLiteralInput(usize),
    #[error("Input {0} has no static shape")]
    DynamicShape(usize),
    #[error("Required argument {0} is absent")]
    MissingArgument(usize),
    #[error("Argument {index} must be {expected}, found {found}")]
    TypeMismatch { index: usize, expected: DType, found: DType },
    #[error("Attribute \"{0}\" is missing or invalid")]
    InvalidAttribute(String),
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    TensorError(#[from] TensorError),
    #[error(transparent)]
    ShapeError(#[from] ndarray::ShapeError),
    #[error(transparent)]
    ContextError(#[from] ContextError),
}

impl FoldError {
    /// Failures that must abort the pass rather than leave the node unfolded.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ContextError(_))
    }
}

pub type Evaluator = fn(&FoldArgs) -> Result<ConstTensor, FoldError>;

/// Operators that need only the static shape of their first input.
const SHAPE_ONLY_OPS: &[&str] = &["Shape"];

/// Literal value of `edge`: either held by the graph or backed by a const-data
/// region of the context (a `Constant` node carrying [`CONST_DATA_ATTR`]).
pub fn literal_value(graph: &Graph, ctx: &mut CompilationContext, edge: &str) -> Result<Option<ConstTensor>, ContextError> {
    if let Some(tensor) = graph.literal(edge) {
        return Ok(Some(tensor.clone()));
    }
    let Some(node) = graph.producer(edge).and_then(|x| graph.node(x)) else {
        return Ok(None);
    };
    if !node.is_op("", CONSTANT_OP) {
        return Ok(None);
    }
    let Some(region_name) = node.attribute_string(CONST_DATA_ATTR) else {
        return Ok(None);
    };
    let region = ctx.const_region(region_name)?.clone();
    let bytes = ctx
        .get_const_data(region_name, true)?
        .map(<[u8]>::to_vec)
        .unwrap_or_default();
    Ok(Some(ConstTensor::new(region.dtype, region.shape, bytes)?))
}

pub struct FoldInterpreter {
    evaluators: HashMap<OpKey, Evaluator>,
}

impl Default for FoldInterpreter {
    fn default() -> Self {
        Self::with_default_catalogue()
    }
}

impl FoldInterpreter {
    pub fn new() -> Self {
        Self {
            evaluators: HashMap::new(),
        }
    }

    pub fn with_default_catalogue() -> Self {
        let mut interpreter = Self::new();
        arithmetic::register(&mut interpreter);
        layout::register(&mut interpreter);
        quantize::register(&mut interpreter);
        interpreter
    }

    pub fn register(&mut self, op: impl Into<OpKey>, evaluator: Evaluator) {
        self.evaluators.insert(op.into(), evaluator);
    }

    /// Keeps only evaluators whose operator is in `ops`.
    pub fn retain<S: AsRef<str>>(&mut self, ops: &[S]) {
        let keep: Vec<OpKey> = ops.iter().map(|x| OpKey::parse(x.as_ref())).collect();
        self.evaluators.retain(|k, _| keep.contains(k));
    }

    pub fn supports(&self, op: &OpKey) -> bool {
        self.evaluators.contains_key(op)
    }

    /// Evaluates `node` without touching the graph.
    pub fn evaluate(&self, graph: &Graph, ctx: &mut CompilationContext, node: NodeId) -> Result<ConstTensor, FoldError> {
        let node = graph
            .node(node)
            .ok_or_else(|| FoldError::Invalid(format!("unknown node {node}")))?;
        let op = OpKey::of_node(node);
        let evaluator = self
            .evaluators
            .get(&op)
            .ok_or_else(|| FoldError::Unsupported(op.clone()))?;
        if node.outputs.len() != 1 {
            return Err(FoldError::MultiOutput(node.outputs.len()));
        }

        let shape_only = op.domain.is_empty() && SHAPE_ONLY_OPS.contains(&op.op_type.as_str());
        let mut inputs = Vec::with_capacity(node.inputs.len());
        let mut infos = Vec::with_capacity(node.inputs.len());
        for i in 0..node.inputs.len() {
            let Some(edge) = node.input(i) else {
                inputs.push(None);
                infos.push(None);
                continue;
            };
            let info = graph.tensor_info(edge).cloned();
            if shape_only && i == 0 {
                if !info.as_ref().is_some_and(|x| x.is_static()) {
                    return Err(FoldError::DynamicShape(i));
                }
                inputs.push(None);
            } else {
                let value = literal_value(graph, ctx, edge)?.ok_or(FoldError::NonLiteralInput(i))?;
                inputs.push(Some(value));
            }
            infos.push(info);
        }
        evaluator(&FoldArgs::new(node, inputs, infos))
    }

    /// Replaces `node` by a `Constant` backed by a new const-data region.
    /// Returns `Ok(false)` when the node is not foldable.
    pub fn fold_node(&self, graph: &mut Graph, ctx: &mut CompilationContext, node: NodeId) -> Result<bool, PassError> {
        let tensor = match self.evaluate(graph, ctx, node) {
            Ok(x) => x,
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                if let Some(x) = graph.node(node) {
                    log::debug!("Not folding {} ({}): {err}", x.name, x.op_type);
                }
                return Ok(false);
            }
        };

        let old = graph.remove_node(node)?;
        let output = &old.outputs[0];
        let region = ctx.const_data().unique_name(output);
        ctx.create_const(&region, tensor.data(), tensor.shape(), tensor.dtype())?;
        NodeBuilder::new(graph)
            .op(CONSTANT_OP)
            .name(&old.name)
            .output_with_info(output, tensor.info())
            .attr(CONST_DATA_ATTR, Attribute::String(region))
            .origin(&old.name)
            .track_provenance(ctx.provenance_mut())
            .build()?;
        log::debug!("Folded {} ({}) into a {} constant", old.name, old.op_type, tensor.dtype());
        ctx.telemetry_mut().count("folded_nodes");
        Ok(true)
    }

    /// Folds every eligible node in one topological sweep, so chains of foldable
    /// nodes collapse completely. Returns how many nodes were folded.
    pub fn fold_graph(&self, graph: &mut Graph, ctx: &mut CompilationContext) -> Result<usize, PassError> {
        let mut folded = 0;
        for id in graph.topological_order()? {
            let Some(node) = graph.node(id) else {
                continue;
            };
            if !self.supports(&OpKey::of_node(node)) {
                continue;
            }
            if self.fold_node(graph, ctx, id)? {
                folded += 1;
            }
        }
        Ok(folded)
    }
}
