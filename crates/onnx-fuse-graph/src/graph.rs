use crate::dtype::DType;
use crate::node::{Attribute, Node, NodeId};
use crate::tensor::{ConstTensor, Dimension, TensorInfo};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Edge \"{0}\" already has a producer")]
    DuplicateEdge(String),
    #[error("Node name \"{0}\" is already in use")]
    DuplicateNodeName(String),
    #[error("Node \"{node}\" consumes edge \"{edge}\" which has no producer")]
    DanglingEdge { node: String, edge: String },
    #[error("Graph output \"{0}\" has no producer")]
    DanglingOutput(String),
    #[error("Graph contains a cycle through node \"{0}\"")]
    Cycle(String),
    #[error("Unknown node {0}")]
    UnknownNode(NodeId),
    #[error("Node \"{0}\" declares no outputs")]
    NoOutputs(String),
}

pub const CONSTANT_OP: &str = "Constant";

/// Mutable dataflow graph: operator nodes connected by uniquely named tensor edges.
///
/// Edges are owned by their producer (a node, a graph input, or an initializer);
/// consumers refer to them by name only.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    name: String,
    nodes: BTreeMap<NodeId, Node>,
    producers: HashMap<String, NodeId>,
    node_names: HashMap<String, NodeId>,
    tensors: HashMap<String, TensorInfo>,
    initializers: BTreeMap<String, ConstTensor>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    metadata: BTreeMap<String, String>,
    source_path: Option<PathBuf>,
    next_node_id: usize,
    needs_resolve: bool,
}

impl Graph {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_produced(&self, edge: &str) -> bool {
        self.producers.contains_key(edge)
            || self.initializers.contains_key(edge)
            || self.inputs.iter().any(|x| x == edge)
    }

    fn unique_node_name(&self, base: &str) -> String {
        if !self.node_names.contains_key(base) {
            return base.to_string();
        }
        let mut i = 1;
        loop {
            let candidate = format!("{base}_{i}");
            if !self.node_names.contains_key(&candidate) {
                return candidate;
            }
            i += 1;
        }
    }

    pub fn add_input(&mut self, name: &str, info: TensorInfo) -> Result<(), GraphError> {
        if self.is_produced(name) {
            return Err(GraphError::DuplicateEdge(name.to_string()));
        }
        self.inputs.push(name.to_string());
        self.tensors.insert(name.to_string(), info);
        self.needs_resolve = true;
        Ok(())
    }

    pub fn add_output(&mut self, name: &str) {
        if !self.outputs.iter().any(|x| x == name) {
            self.outputs.push(name.to_string());
        }
        self.tensors.entry(name.to_string()).or_default();
        self.needs_resolve = true;
    }

    pub fn add_initializer(&mut self, name: &str, tensor: ConstTensor) -> Result<(), GraphError> {
        if self.is_produced(name) {
            return Err(GraphError::DuplicateEdge(name.to_string()));
        }
        self.tensors.insert(name.to_string(), tensor.info());
        self.initializers.insert(name.to_string(), tensor);
        self.needs_resolve = true;
        Ok(())
    }

    pub fn remove_initializer(&mut self, name: &str) -> Option<ConstTensor> {
        self.needs_resolve = true;
        self.initializers.remove(name)
    }

    pub fn initializer(&self, name: &str) -> Option<&ConstTensor> {
        self.initializers.get(name)
    }

    pub fn initializers(&self) -> impl Iterator<Item = (&str, &ConstTensor)> {
        self.initializers.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Inserts `node`, naming it after its first output when no name is given.
    pub fn add_node(&mut self, mut node: Node) -> Result<NodeId, GraphError> {
        if node.outputs.is_empty() {
            return Err(GraphError::NoOutputs(node.name));
        }
        let mut seen = BTreeSet::new();
        for output in &node.outputs {
            if output.is_empty() || self.is_produced(output) || !seen.insert(output.as_str()) {
                return Err(GraphError::DuplicateEdge(output.clone()));
            }
        }
        if node.name.is_empty() {
            node.name = self.unique_node_name(&node.outputs[0]);
        } else if self.node_names.contains_key(&node.name) {
            return Err(GraphError::DuplicateNodeName(node.name));
        }

        let id = NodeId::new(self.next_node_id);
        self.next_node_id += 1;
        for output in &node.outputs {
            self.producers.insert(output.clone(), id);
            self.tensors.entry(output.clone()).or_default();
        }
        self.node_names.insert(node.name.clone(), id);
        self.nodes.insert(id, node);
        self.needs_resolve = true;
        Ok(id)
    }

    pub fn remove_node(&mut self, id: NodeId) -> Result<Node, GraphError> {
        let node = self.nodes.remove(&id).ok_or(GraphError::UnknownNode(id))?;
        for output in &node.outputs {
            self.producers.remove(output);
        }
        self.node_names.remove(&node.name);
        self.needs_resolve = true;
        Ok(node)
    }

    pub fn set_node_input(&mut self, id: NodeId, index: usize, edge: &str) -> Result<(), GraphError> {
        let node = self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))?;
        if node.inputs.len() <= index {
            node.inputs.resize(index + 1, String::new());
        }
        node.inputs[index] = edge.to_string();
        self.needs_resolve = true;
        Ok(())
    }

    pub fn set_node_attribute(&mut self, id: NodeId, name: &str, value: Attribute) -> Result<(), GraphError> {
        let node = self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))?;
        node.attributes.insert(name.to_string(), value);
        Ok(())
    }

    /// Points every consumer of `old` at `new`. Graph outputs are left alone.
    pub fn rewire_consumers(&mut self, old: &str, new: &str) -> usize {
        let mut count = 0;
        for node in self.nodes.values_mut() {
            for input in node.inputs.iter_mut() {
                if input == old {
                    *input = new.to_string();
                    count += 1;
                }
            }
        }
        if count > 0 {
            self.needs_resolve = true;
        }
        count
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn contains_node(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.node_names.get(name).copied()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().map(|(k, v)| (*k, v))
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn producer(&self, edge: &str) -> Option<NodeId> {
        self.producers.get(edge).copied()
    }

    pub fn consumers(&self, edge: &str) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.inputs.iter().any(|x| x == edge))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn is_graph_input(&self, edge: &str) -> bool {
        self.inputs.iter().any(|x| x == edge)
    }

    pub fn is_graph_output(&self, edge: &str) -> bool {
        self.outputs.iter().any(|x| x == edge)
    }

    /// True when `edge` carries literal data: an initializer or the output of a
    /// `Constant` node.
    pub fn is_literal(&self, edge: &str) -> bool {
        if self.initializers.contains_key(edge) {
            return true;
        }
        match self.producer(edge).and_then(|id| self.nodes.get(&id)) {
            Some(node) => node.is_op("", CONSTANT_OP),
            None => false,
        }
    }

    /// Literal value held directly by the graph, if any.
    pub fn literal(&self, edge: &str) -> Option<&ConstTensor> {
        if let Some(x) = self.initializers.get(edge) {
            return Some(x);
        }
        let node = self.nodes.get(&self.producer(edge)?)?;
        if node.is_op("", CONSTANT_OP) {
            node.attribute_tensor("value")
        } else {
            None
        }
    }

    pub fn tensor_info(&self, edge: &str) -> Option<&TensorInfo> {
        self.tensors.get(edge)
    }

    pub fn set_tensor_info(&mut self, edge: &str, info: TensorInfo) {
        self.tensors.insert(edge.to_string(), info);
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn metadata_map(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn set_metadata(&mut self, key: &str, value: &str) {
        self.metadata.insert(key.to_string(), value.to_string());
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn set_source_path(&mut self, path: impl Into<PathBuf>) {
        self.source_path = Some(path.into());
    }

    pub fn needs_resolve(&self) -> bool {
        self.needs_resolve
    }

    pub fn mark_needs_resolve(&mut self) {
        self.needs_resolve = true;
    }

    /// Topological order of all nodes. Ties are broken by node id so the order is
    /// stable for a given sequence of mutations.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let mut indegree: BTreeMap<NodeId, usize> = self.nodes.keys().map(|x| (*x, 0)).collect();
        let mut successors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for (id, node) in &self.nodes {
            for edge in node.present_inputs() {
                if let Some(producer) = self.producers.get(edge) {
                    successors.entry(*producer).or_default().push(*id);
                    *indegree.entry(*id).or_default() += 1;
                }
            }
        }

        let mut ready: BTreeSet<NodeId> = indegree
            .iter()
            .filter(|(_, x)| **x == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            if let Some(next) = successors.get(&id) {
                for succ in next {
                    if let Some(degree) = indegree.get_mut(succ) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.insert(*succ);
                        }
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck = indegree
                .iter()
                .find(|(_, x)| **x > 0)
                .and_then(|(id, _)| self.nodes.get(id))
                .map(|x| x.name.clone())
                .unwrap_or_default();
            return Err(GraphError::Cycle(stuck));
        }
        Ok(order)
    }

    /// Validates edge references and refreshes shape/type metadata.
    pub fn resolve(&mut self) -> Result<(), GraphError> {
        for node in self.nodes.values() {
            for edge in node.present_inputs() {
                if !self.is_produced(edge) {
                    return Err(GraphError::DanglingEdge {
                        node: node.name.clone(),
                        edge: edge.to_string(),
                    });
                }
            }
        }
        for output in &self.outputs {
            if !self.is_produced(output) {
                return Err(GraphError::DanglingOutput(output.clone()));
            }
        }

        for id in self.topological_order()? {
            let node = &self.nodes[&id];
            let inferred = infer_output_info(node, &self.tensors);
            for (output, info) in node.outputs.clone().into_iter().zip(inferred) {
                // Inferred facts replace stale ones; declared infos fill the gaps.
                let entry = self.tensors.entry(output).or_default();
                if info.dtype.is_some() {
                    entry.dtype = info.dtype;
                }
                if info.shape.is_some() {
                    entry.shape = info.shape;
                }
            }
        }
        self.needs_resolve = false;
        Ok(())
    }

    /// Removes nodes whose outputs are neither consumed nor graph outputs.
    pub fn eliminate_dead_nodes(&mut self) -> Result<usize, GraphError> {
        let mut uses: HashMap<String, usize> = HashMap::new();
        for node in self.nodes.values() {
            for edge in node.present_inputs() {
                *uses.entry(edge.to_string()).or_default() += 1;
            }
        }
        for output in &self.outputs {
            *uses.entry(output.clone()).or_default() += 1;
        }

        let mut removed = 0;
        for id in self.topological_order()?.into_iter().rev() {
            let node = &self.nodes[&id];
            let dead = node
                .outputs
                .iter()
                .all(|x| uses.get(x).copied().unwrap_or(0) == 0);
            if dead {
                for edge in node.present_inputs() {
                    if let Some(count) = uses.get_mut(edge) {
                        *count -= 1;
                    }
                }
                let node = self.remove_node(id)?;
                log::trace!("Eliminated dead node {}", node.name);
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let x = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let y = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (x, y) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

fn infer_output_info(node: &Node, tensors: &HashMap<String, TensorInfo>) -> Vec<TensorInfo> {
    let input_info = |i: usize| -> TensorInfo {
        node.input(i)
            .and_then(|x| tensors.get(x))
            .cloned()
            .unwrap_or_default()
    };
    // FixNeuron lives in a vendor domain but is shape-preserving everywhere.
    if !node.domain.is_empty() && node.op_type != "FixNeuron" {
        return vec![TensorInfo::unknown(); node.outputs.len()];
    }
    let first = match node.op_type.as_str() {
        CONSTANT_OP => node.attribute_tensor("value").map(|x| x.info()).unwrap_or_default(),
        "Identity" | "Relu" | "Neg" | "Sigmoid" | "Tanh" | "Dropout" | "FixNeuron" => input_info(0),
        "Add" | "Sub" | "Mul" | "Div" => {
            let (a, b) = (input_info(0), input_info(1));
            let shape = match (a.static_shape(), b.static_shape()) {
                (Some(x), Some(y)) => broadcast_shapes(&x, &y)
                    .map(|s| s.into_iter().map(Dimension::Known).collect()),
                _ => None,
            };
            TensorInfo {
                dtype: a.dtype.or(b.dtype),
                shape,
            }
        }
        "QuantizeLinear" => TensorInfo {
            dtype: Some(input_info(2).dtype.unwrap_or(DType::U8)),
            shape: input_info(0).shape,
        },
        "DequantizeLinear" => TensorInfo {
            dtype: Some(DType::F32),
            shape: input_info(0).shape,
        },
        "Shape" => TensorInfo {
            dtype: Some(DType::I64),
            shape: input_info(0)
                .shape
                .map(|x| vec![Dimension::Known(x.len())]),
        },
        _ => TensorInfo::unknown(),
    };
    let mut out = vec![first];
    out.resize(node.outputs.len(), TensorInfo::unknown());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcasting() {
        assert_eq!(broadcast_shapes(&[2, 3], &[3]), Some(vec![2, 3]));
        assert_eq!(broadcast_shapes(&[2, 1], &[1, 4]), Some(vec![2, 4]));
        assert_eq!(broadcast_shapes(&[2], &[3]), None);
    }

    #[test]
    fn generated_names_are_unique() {
        let mut graph = Graph::new("g");
        graph.add_input("x", TensorInfo::new(DType::F32, &[2])).unwrap();
        let a = graph
            .add_node(Node::new("Relu").with_inputs(["x"]).with_outputs(["y"]))
            .unwrap();
        graph.remove_node(a).unwrap();
        graph
            .add_node(Node::new("Relu").named("y").with_inputs(["x"]).with_outputs(["z"]))
            .unwrap();
        let c = graph
            .add_node(Node::new("Relu").with_inputs(["z"]).with_outputs(["y"]))
            .unwrap();
        assert_eq!(graph.node(c).unwrap().name, "y_1");
    }
}
