//! Structural patterns over the operator graph.
//!
//! A pattern is a small tree (stored as an arena) of wildcards, literal matchers
//! and operator matchers. Matching walks it top-down from a candidate node and
//! records every visited pattern node in a [`Binder`].
use onnx_fuse_graph::{Graph, Node, NodeId};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq)]
pub struct PatternId {
    inner: usize,
}

impl std::fmt::Display for PatternId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.inner)
    }
}

/// Operator type qualified by its domain. Parsed from `"domain:op"` or a bare
/// `"op"` (default domain).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpKey {
    pub domain: String,
    pub op_type: String,
}

impl OpKey {
    pub fn new(domain: &str, op_type: &str) -> Self {
        Self {
            domain: domain.to_string(),
            op_type: op_type.to_string(),
        }
    }

    pub fn parse(name: &str) -> Self {
        match name.rsplit_once(':') {
            Some((domain, op_type)) => Self::new(domain, op_type),
            None => Self::new("", name),
        }
    }

    pub fn of_node(node: &Node) -> Self {
        Self::new(&node.domain, &node.op_type)
    }

    pub fn matches(&self, node: &Node) -> bool {
        node.is_op(&self.domain, &self.op_type)
    }
}

impl From<&str> for OpKey {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}

impl std::fmt::Display for OpKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.domain.is_empty() {
            write!(f, "{}", self.op_type)
        } else {
            write!(f, "{}:{}", self.domain, self.op_type)
        }
    }
}

#[derive(Debug, Clone)]
enum PatternNode {
    Wildcard,
    Constant,
    Operator {
        op: OpKey,
        children: Vec<PatternId>,
        optional: Vec<bool>,
    },
}

/// What a pattern node was bound to: the producing node (absent for graph inputs
/// and initializers) and the edge itself (absent for an unfilled optional slot).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct NodeInput {
    pub node: Option<NodeId>,
    pub edge: Option<String>,
}

impl NodeInput {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn of_edge(graph: &Graph, edge: &str) -> Self {
        Self {
            node: graph.producer(edge),
            edge: Some(edge.to_string()),
        }
    }

    pub fn of_node(graph: &Graph, node: NodeId) -> Self {
        Self {
            node: Some(node),
            edge: graph.node(node).and_then(|x| x.output(0)).map(str::to_string),
        }
    }

    pub fn is_none(&self) -> bool {
        self.node.is_none() && self.edge.is_none()
    }
}

/// Result of one successful match. Never mutated after matching completes.
#[derive(Debug, Clone, Default)]
pub struct Binder {
    bindings: HashMap<PatternId, NodeInput>,
}

impl Binder {
    pub fn get(&self, id: PatternId) -> Option<&NodeInput> {
        self.bindings.get(&id)
    }

    pub fn contains(&self, id: PatternId) -> bool {
        self.bindings.contains_key(&id)
    }

    pub fn node(&self, id: PatternId) -> Option<NodeId> {
        self.bindings.get(&id).and_then(|x| x.node)
    }

    pub fn edge(&self, id: PatternId) -> Option<&str> {
        self.bindings.get(&id).and_then(|x| x.edge.as_deref())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PatternId, &NodeInput)> {
        self.bindings.iter().map(|(k, v)| (*k, v))
    }

    fn bind(&mut self, id: PatternId, input: &NodeInput) -> bool {
        match self.bindings.get(&id) {
            // A shared sub-pattern must resolve to the same element everywhere.
            Some(existing) => existing == input,
            None => {
                self.bindings.insert(id, input.clone());
                true
            }
        }
    }
}

impl std::ops::Index<PatternId> for Binder {
    type Output = NodeInput;

    fn index(&self, id: PatternId) -> &NodeInput {
        &self.bindings[&id]
    }
}

#[derive(Debug, Default)]
pub struct PatternBuilder {
    nodes: Vec<PatternNode>,
}

impl PatternBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, node: PatternNode) -> PatternId {
        self.nodes.push(node);
        PatternId {
            inner: self.nodes.len() - 1,
        }
    }

    /// Matches any producer, including a graph input or an unfilled slot.
    pub fn wildcard(&mut self) -> PatternId {
        self.push(PatternNode::Wildcard)
    }

    /// Matches only an edge carrying literal data.
    pub fn constant(&mut self) -> PatternId {
        self.push(PatternNode::Constant)
    }

    pub fn node(&mut self, op: impl Into<OpKey>, children: &[PatternId]) -> PatternId {
        self.node_with_optional(op, children, &vec![false; children.len()])
    }

    pub fn node_with_optional(&mut self, op: impl Into<OpKey>, children: &[PatternId], optional: &[bool]) -> PatternId {
        assert_eq!(children.len(), optional.len(), "one optional flag per child pattern");
        for child in children {
            assert!(child.inner < self.nodes.len(), "child pattern {child} does not exist");
        }
        self.push(PatternNode::Operator {
            op: op.into(),
            children: children.to_vec(),
            optional: optional.to_vec(),
        })
    }

    pub fn build(self, root: PatternId) -> Pattern {
        assert!(root.inner < self.nodes.len(), "root pattern {root} does not exist");
        Pattern {
            nodes: self.nodes,
            root,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pattern {
    nodes: Vec<PatternNode>,
    root: PatternId,
}

impl Pattern {
    pub fn root(&self) -> PatternId {
        self.root
    }

    /// Operator the root must have, if the root is an operator pattern.
    pub fn root_op(&self) -> Option<&OpKey> {
        match &self.nodes[self.root.inner] {
            PatternNode::Operator { op, .. } => Some(op),
            _ => None,
        }
    }

    /// Attempts to bind the pattern rooted at `node`. Fails fast: the first
    /// mismatch abandons the whole attempt.
    pub fn match_node(&self, graph: &Graph, node: NodeId) -> Option<Binder> {
        self.match_input(graph, &NodeInput::of_node(graph, node))
    }

    pub fn match_input(&self, graph: &Graph, input: &NodeInput) -> Option<Binder> {
        let mut binder = Binder::default();
        if self.match_at(graph, self.root, input, &mut binder) {
            Some(binder)
        } else {
            None
        }
    }

    fn match_at(&self, graph: &Graph, id: PatternId, input: &NodeInput, binder: &mut Binder) -> bool {
        match &self.nodes[id.inner] {
            PatternNode::Wildcard => binder.bind(id, input),
            PatternNode::Constant => match &input.edge {
                Some(edge) if graph.is_literal(edge) => binder.bind(id, input),
                _ => false,
            },
            PatternNode::Operator { op, children, optional } => {
                let Some(node) = input.node.and_then(|x| graph.node(x)) else {
                    return false;
                };
                if !op.matches(node) {
                    return false;
                }
                // Inputs beyond the pattern's children would be lost by a rewrite.
                if (children.len()..node.inputs.len()).any(|i| node.input(i).is_some()) {
                    return false;
                }
                if !binder.bind(id, input) {
                    return false;
                }
                for (i, child) in children.iter().enumerate() {
                    let matched = match node.input(i) {
                        Some(edge) => self.match_at(graph, *child, &NodeInput::of_edge(graph, edge), binder),
                        None if optional[i] => self.bind_absent(*child, binder),
                        None => false,
                    };
                    if !matched {
                        return false;
                    }
                }
                true
            }
        }
    }

    fn bind_absent(&self, id: PatternId, binder: &mut Binder) -> bool {
        if !binder.bind(id, &NodeInput::none()) {
            return false;
        }
        if let PatternNode::Operator { children, .. } = &self.nodes[id.inner] {
            for child in children {
                if !self.bind_absent(*child, binder) {
                    return false;
                }
            }
        }
        true
    }
}
