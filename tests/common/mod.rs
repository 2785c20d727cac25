#![allow(dead_code)]

use onnx_fuse::graph::{ConstTensor, DType, Graph, Node, TensorInfo};
use onnx_fuse::{CompilationContext, CompileConfig};
use std::path::Path;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn context() -> CompilationContext {
    CompilationContext::new(&CompileConfig::default(), "test")
}

pub fn config_in(dir: &Path) -> CompileConfig {
    CompileConfig {
        cache_dir: dir.to_path_buf(),
        ..Default::default()
    }
}

/// `y = Relu(MatMul(x, w) + b)` with `x: [1, 2]`, `w: [2, 3]`, `b: [3]`.
pub fn mlp_graph() -> Graph {
    let mut graph = Graph::new("mlp");
    graph.add_input("x", TensorInfo::new(DType::F32, &[1, 2])).unwrap();
    graph
        .add_initializer(
            "w",
            ConstTensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]).unwrap(),
        )
        .unwrap();
    graph
        .add_initializer("b", ConstTensor::from_vec(vec![0.5f32, 0.5, 0.5], vec![3]).unwrap())
        .unwrap();
    graph
        .add_node(Node::new("MatMul").named("matmul").with_inputs(["x", "w"]).with_outputs(["h"]))
        .unwrap();
    graph
        .add_node(Node::new("Add").named("add").with_inputs(["h", "b"]).with_outputs(["z"]))
        .unwrap();
    graph
        .add_node(Node::new("Relu").named("relu").with_inputs(["z"]).with_outputs(["y"]))
        .unwrap();
    graph.add_output("y");
    graph.resolve().unwrap();
    graph
}

pub fn node_names(graph: &Graph) -> Vec<String> {
    let mut names: Vec<String> = graph.nodes().map(|(_, x)| x.name.clone()).collect();
    names.sort();
    names
}
