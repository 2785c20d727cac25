//! Content fingerprints that identify a graph independently of file paths.
use onnx_fuse_graph::{Graph, GraphError, TensorInfo};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, strum_macros::Display)]
pub enum FingerprintAlgorithm {
    /// Output-edge names and shapes of every node, in topological order.
    NodeOutputs,
    /// Names and shapes of the graph inputs and outputs only.
    Boundary,
}

fn to_hex(digest: &[u8]) -> String {
    digest.iter().map(|x| format!("{x:02x}")).collect()
}

fn hash_edge(hasher: &mut Sha256, name: &str, info: Option<&TensorInfo>) {
    hasher.update(name.as_bytes());
    hasher.update(b":");
    hasher.update(info.map(|x| x.describe()).unwrap_or_default().as_bytes());
    hasher.update(b";");
}

/// Digest over the output edges of all nodes except those of `exclude_ops`.
/// Node names do not contribute.
pub fn node_output_fingerprint<S: AsRef<str>>(graph: &Graph, exclude_ops: &[S]) -> Result<String, GraphError> {
    let mut hasher = Sha256::new();
    for id in graph.topological_order()? {
        let Some(node) = graph.node(id) else {
            continue;
        };
        if exclude_ops.iter().any(|x| x.as_ref() == node.op_type) {
            continue;
        }
        for output in &node.outputs {
            hash_edge(&mut hasher, output, graph.tensor_info(output));
        }
    }
    Ok(to_hex(&hasher.finalize()))
}

pub fn boundary_fingerprint(graph: &Graph) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"inputs;");
    for input in graph.inputs() {
        hash_edge(&mut hasher, input, graph.tensor_info(input));
    }
    hasher.update(b"outputs;");
    for output in graph.outputs() {
        hash_edge(&mut hasher, output, graph.tensor_info(output));
    }
    to_hex(&hasher.finalize())
}

pub fn file_hash(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1 << 16];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(to_hex(&hasher.finalize()))
}

/// Everything a registry lookup can match on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphFingerprints {
    pub node_outputs: String,
    pub boundary: String,
    pub node_count: usize,
}

impl GraphFingerprints {
    pub fn compute<S: AsRef<str>>(graph: &Graph, exclude_ops: &[S]) -> Result<Self, GraphError> {
        Ok(Self {
            node_outputs: node_output_fingerprint(graph, exclude_ops)?,
            boundary: boundary_fingerprint(graph),
            node_count: graph.node_count(),
        })
    }
}
