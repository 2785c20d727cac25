use crate::context::provenance::ProvenanceMap;
use crate::pattern::OpKey;
use onnx_fuse_graph::{Attribute, Graph, GraphError, Node, NodeId, TensorInfo};

/// Fluent construction of a node that is inserted into the graph on `build`.
///
/// With provenance tracking enabled, the new node is recorded as derived from the
/// nodes named through `derived_from`/`origin`.
pub struct NodeBuilder<'a> {
    graph: &'a mut Graph,
    provenance: Option<&'a mut ProvenanceMap>,
    node: Node,
    output_infos: Vec<(String, TensorInfo)>,
    origins: Vec<String>,
}

impl<'a> NodeBuilder<'a> {
    pub fn new(graph: &'a mut Graph) -> Self {
        Self {
            graph,
            provenance: None,
            node: Node::new(""),
            output_infos: vec![],
            origins: vec![],
        }
    }

    pub fn op(mut self, op: impl Into<OpKey>) -> Self {
        let op = op.into();
        self.node.domain = op.domain;
        self.node.op_type = op.op_type;
        self
    }

    pub fn domain(mut self, domain: &str) -> Self {
        self.node.domain = domain.to_string();
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.node.name = name.to_string();
        self
    }

    pub fn input(mut self, edge: &str) -> Self {
        self.node.inputs.push(edge.to_string());
        self
    }

    pub fn inputs<S: AsRef<str>>(mut self, edges: impl IntoIterator<Item = S>) -> Self {
        self.node.inputs.extend(edges.into_iter().map(|x| x.as_ref().to_string()));
        self
    }

    /// Absent optional inputs keep their position as an empty edge name.
    pub fn optional_input(mut self, edge: Option<&str>) -> Self {
        self.node.inputs.push(edge.unwrap_or_default().to_string());
        self
    }

    pub fn output(mut self, edge: &str) -> Self {
        self.node.outputs.push(edge.to_string());
        self
    }

    pub fn output_with_info(mut self, edge: &str, info: TensorInfo) -> Self {
        self.node.outputs.push(edge.to_string());
        self.output_infos.push((edge.to_string(), info));
        self
    }

    pub fn attr(mut self, name: &str, value: Attribute) -> Self {
        self.node.attributes.insert(name.to_string(), value);
        self
    }

    /// Copies every attribute of `source` not already set on this node.
    pub fn clone_attributes_from(mut self, source: NodeId) -> Result<Self, GraphError> {
        let node = self.graph.node(source).ok_or(GraphError::UnknownNode(source))?;
        for (name, value) in &node.attributes {
            self.node
                .attributes
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
        Ok(self)
    }

    pub fn derived_from(mut self, nodes: &[NodeId]) -> Self {
        for id in nodes {
            if let Some(node) = self.graph.node(*id) {
                self.origins.push(node.name.clone());
            }
        }
        self
    }

    /// Records an origin by name, for nodes that were already removed.
    pub fn origin(mut self, node_name: &str) -> Self {
        self.origins.push(node_name.to_string());
        self
    }

    pub fn track_provenance(mut self, provenance: &'a mut ProvenanceMap) -> Self {
        self.provenance = Some(provenance);
        self
    }

    pub fn build(self) -> Result<NodeId, GraphError> {
        let id = self.graph.add_node(self.node)?;
        for (edge, info) in self.output_infos {
            self.graph.set_tensor_info(&edge, info);
        }
        if let Some(provenance) = self.provenance {
            if !self.origins.is_empty() {
                let name = self.graph.node(id).map(|x| x.name.clone()).unwrap_or_default();
                provenance.record(&name, &self.origins);
            }
        }
        Ok(id)
    }
}
