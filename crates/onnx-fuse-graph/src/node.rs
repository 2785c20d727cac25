use crate::tensor::ConstTensor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeId {
    inner: usize,
}

impl NodeId {
    pub(crate) fn new(inner: usize) -> Self {
        Self { inner }
    }

    pub fn index(&self) -> usize {
        self.inner
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.inner)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Attribute {
    Float(f32),
    Int(i64),
    String(String),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
    Strings(Vec<String>),
    Tensor(ConstTensor),
}

/// One operator instance. Input edges are positional; an empty name marks an
/// absent optional input.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub op_type: String,
    pub domain: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: BTreeMap<String, Attribute>,
}

impl Node {
    pub fn new(op_type: &str) -> Self {
        Self {
            name: String::new(),
            op_type: op_type.to_string(),
            domain: String::new(),
            inputs: vec![],
            outputs: vec![],
            attributes: BTreeMap::new(),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn in_domain(mut self, domain: &str) -> Self {
        self.domain = domain.to_string();
        self
    }

    pub fn with_inputs<S: AsRef<str>>(mut self, inputs: impl IntoIterator<Item = S>) -> Self {
        self.inputs = inputs.into_iter().map(|x| x.as_ref().to_string()).collect();
        self
    }

    pub fn with_outputs<S: AsRef<str>>(mut self, outputs: impl IntoIterator<Item = S>) -> Self {
        self.outputs = outputs.into_iter().map(|x| x.as_ref().to_string()).collect();
        self
    }

    pub fn with_attribute(mut self, name: &str, value: Attribute) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    /// Input edge at `index`, or `None` when the slot is missing or left empty.
    pub fn input(&self, index: usize) -> Option<&str> {
        self.inputs
            .get(index)
            .map(String::as_str)
            .filter(|x| !x.is_empty())
    }

    pub fn present_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(String::as_str).filter(|x| !x.is_empty())
    }

    pub fn output(&self, index: usize) -> Option<&str> {
        self.outputs.get(index).map(String::as_str)
    }

    pub fn is_op(&self, domain: &str, op_type: &str) -> bool {
        self.op_type == op_type && self.domain == domain
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }

    pub fn attribute_int(&self, name: &str) -> Option<i64> {
        match self.attributes.get(name) {
            Some(Attribute::Int(x)) => Some(*x),
            _ => None,
        }
    }

    pub fn attribute_float(&self, name: &str) -> Option<f32> {
        match self.attributes.get(name) {
            Some(Attribute::Float(x)) => Some(*x),
            _ => None,
        }
    }

    pub fn attribute_ints(&self, name: &str) -> Option<&[i64]> {
        match self.attributes.get(name) {
            Some(Attribute::Ints(x)) => Some(x),
            _ => None,
        }
    }

    pub fn attribute_string(&self, name: &str) -> Option<&str> {
        match self.attributes.get(name) {
            Some(Attribute::String(x)) => Some(x),
            _ => None,
        }
    }

    pub fn attribute_tensor(&self, name: &str) -> Option<&ConstTensor> {
        match self.attributes.get(name) {
            Some(Attribute::Tensor(x)) => Some(x),
            _ => None,
        }
    }
}
