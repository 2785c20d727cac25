use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Description of a fused subgraph handed to the device backend.
///
/// `id` is assigned when the subgraph is appended to the graph and equals the
/// name of the fused node that replaces the member nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaDef {
    pub id: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub constant_initializers: Vec<String>,
    pub nodes: Vec<String>,
    pub device: String,
    pub generic_params: BTreeMap<String, String>,
}

impl MetaDef {
    pub fn new(op_type: &str) -> Self {
        Self {
            op_type: op_type.to_string(),
            ..Default::default()
        }
    }

    pub fn with_inputs<S: AsRef<str>>(mut self, inputs: impl IntoIterator<Item = S>) -> Self {
        self.inputs = inputs.into_iter().map(|x| x.as_ref().to_string()).collect();
        self
    }

    pub fn with_outputs<S: AsRef<str>>(mut self, outputs: impl IntoIterator<Item = S>) -> Self {
        self.outputs = outputs.into_iter().map(|x| x.as_ref().to_string()).collect();
        self
    }

    pub fn with_nodes<S: AsRef<str>>(mut self, nodes: impl IntoIterator<Item = S>) -> Self {
        self.nodes = nodes.into_iter().map(|x| x.as_ref().to_string()).collect();
        self
    }

    pub fn with_device(mut self, device: &str) -> Self {
        self.device = device.to_string();
        self
    }

    pub fn with_param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.generic_params.insert(key.to_string(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.generic_params.get(key).map(String::as_str)
    }
}
