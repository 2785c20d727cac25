mod common;

use onnx_fuse::context::FUSED_DOMAIN;
use onnx_fuse::graph::{ConstTensor, DType, Graph, Node, TensorInfo};
use onnx_fuse::pass::PassOrchestrator;
use onnx_fuse::passes::{CONST_FOLD, FUSE_MATMUL_ADD, MATMUL_ADD_OP, REMOVE_IDENTITY};
use onnx_fuse::{PassConfig, PassError, PassRegistry};

fn run(graph: &mut Graph, passes: &[PassConfig]) -> onnx_fuse::CompilationContext {
    let registry = PassRegistry::with_builtin_passes();
    let mut ctx = common::context();
    PassOrchestrator::new(&registry).run(graph, &mut ctx, passes).unwrap();
    ctx
}

fn f32_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|x| f32::from_le_bytes([x[0], x[1], x[2], x[3]]))
        .collect()
}

#[test]
fn matmul_add_becomes_one_device_node() {
    common::init_logging();
    let mut graph = common::mlp_graph();
    let mut ctx = run(&mut graph, &[PassConfig::new(FUSE_MATMUL_ADD)]);

    assert_eq!(common::node_names(&graph), vec!["relu", "z"]);
    let fused = graph.node(graph.find_node("z").unwrap()).unwrap();
    assert_eq!(fused.domain, FUSED_DOMAIN);
    assert_eq!(fused.op_type, MATMUL_ADD_OP);
    assert_eq!(fused.inputs, vec!["x", "w", "b"]);

    let meta_def = ctx.meta_defs()[0].clone();
    assert_eq!(meta_def.nodes, vec!["matmul", "add"]);
    assert_eq!(meta_def.param("weights"), Some("z/weights"));
    assert_eq!(meta_def.param("bias"), Some("z/bias"));
    assert_eq!(meta_def.param("weights_layout"), Some("NK"));
    assert_eq!(meta_def.param("in_features"), Some("2"));
    assert_eq!(meta_def.param("out_features"), Some("3"));

    // Transposed weights are produced on first use only.
    assert!(ctx.get_const_data("z/weights", false).unwrap().is_none());
    let weights = f32_values(ctx.get_const_data("z/weights", true).unwrap().unwrap());
    assert_eq!(weights, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    assert_eq!(ctx.const_region("z/weights").unwrap().shape, vec![3, 2]);
    let bias = f32_values(ctx.get_const_data("z/bias", false).unwrap().unwrap());
    assert_eq!(bias, vec![0.5, 0.5, 0.5]);
}

#[test]
fn shared_weights_use_one_region() {
    let mut graph = common::mlp_graph();
    graph
        .add_node(Node::new("MatMul").named("matmul2").with_inputs(["x", "w"]).with_outputs(["h2"]))
        .unwrap();
    graph
        .add_node(Node::new("Add").named("add2").with_inputs(["h2", "b"]).with_outputs(["z2"]))
        .unwrap();
    graph.add_output("z2");
    let mut ctx = run(&mut graph, &[PassConfig::new(FUSE_MATMUL_ADD)]);

    assert_eq!(ctx.meta_defs().len(), 2);
    let first = ctx.const_region("z/weights").unwrap().clone();
    assert_eq!(ctx.const_region("z2/weights").unwrap(), &first);
    assert_eq!(ctx.const_region("w/nk").unwrap(), &first);
    ctx.materialize_all().unwrap();
    assert_eq!(ctx.get_const_data("z2/weights", false).unwrap().unwrap().len(), 24);
}

#[test]
fn shared_matmul_output_is_not_fused() {
    let mut graph = common::mlp_graph();
    graph
        .add_node(Node::new("Neg").named("tap").with_inputs(["h"]).with_outputs(["h_neg"]))
        .unwrap();
    graph.add_output("h_neg");
    let ctx = run(&mut graph, &[PassConfig::new(FUSE_MATMUL_ADD)]);
    assert!(ctx.meta_defs().is_empty());
    assert!(graph.find_node("matmul").is_some());
}

#[test]
fn folded_weights_feed_the_fusion() {
    let mut graph = Graph::new("folded_weights");
    graph.add_input("x", TensorInfo::new(DType::F32, &[1, 2])).unwrap();
    graph
        .add_initializer("w_t", ConstTensor::from_vec(vec![1.0f32, 3.0, 2.0, 4.0], vec![2, 2]).unwrap())
        .unwrap();
    graph
        .add_initializer("b", ConstTensor::from_vec(vec![1.0f32, 1.0], vec![2]).unwrap())
        .unwrap();
    graph
        .add_node(Node::new("Transpose").named("transpose").with_inputs(["w_t"]).with_outputs(["w"]))
        .unwrap();
    graph
        .add_node(Node::new("MatMul").named("matmul").with_inputs(["x", "w"]).with_outputs(["h"]))
        .unwrap();
    graph
        .add_node(Node::new("Add").named("add").with_inputs(["h", "b"]).with_outputs(["y"]))
        .unwrap();
    graph.add_output("y");

    let mut ctx = run(
        &mut graph,
        &[PassConfig::new(CONST_FOLD), PassConfig::new(FUSE_MATMUL_ADD)],
    );
    assert_eq!(ctx.meta_defs().len(), 1);
    // `w` is [[1, 2], [3, 4]]; its N-by-K layout is the original `w_t`.
    let weights = f32_values(ctx.get_const_data("y/weights", true).unwrap().unwrap());
    assert_eq!(weights, vec![1.0, 3.0, 2.0, 4.0]);
    assert_eq!(ctx.telemetry().counter("folded_nodes"), 1);
    assert_eq!(ctx.telemetry().timings().len(), 2);
}

fn identity_chain() -> Graph {
    let mut graph = Graph::new("identities");
    graph.add_input("x", TensorInfo::new(DType::F32, &[2])).unwrap();
    graph.add_initializer("ratio", ConstTensor::scalar(0.5f32)).unwrap();
    graph.add_initializer("training", ConstTensor::scalar(true)).unwrap();
    graph.add_initializer("inference", ConstTensor::scalar(false)).unwrap();
    graph
        .add_node(Node::new("Identity").named("id0").with_inputs(["x"]).with_outputs(["a"]))
        .unwrap();
    graph
        .add_node(Node::new("Dropout").named("drop_eval").with_inputs(["a", "ratio", "inference"]).with_outputs(["b"]))
        .unwrap();
    graph
        .add_node(Node::new("Dropout").named("drop_train").with_inputs(["b", "ratio", "training"]).with_outputs(["c"]))
        .unwrap();
    graph
        .add_node(Node::new("Relu").named("relu").with_inputs(["c"]).with_outputs(["d"]))
        .unwrap();
    graph
        .add_node(Node::new("Identity").named("id_out").with_inputs(["d"]).with_outputs(["y"]))
        .unwrap();
    graph.add_output("y");
    graph
}

#[test]
fn identities_and_inference_dropout_are_removed() {
    let mut graph = identity_chain();
    let ctx = run(&mut graph, &[PassConfig::new(REMOVE_IDENTITY)]);

    assert_eq!(common::node_names(&graph), vec!["drop_train", "id_out", "relu"]);
    let drop_train = graph.node(graph.find_node("drop_train").unwrap()).unwrap();
    assert_eq!(drop_train.input(0), Some("x"));
    assert_eq!(ctx.telemetry().counter("rule_rewrites"), 2);
}

#[test]
fn remove_identity_accepts_an_operator_list() {
    let mut graph = identity_chain();
    run(
        &mut graph,
        &[PassConfig::new(REMOVE_IDENTITY).with_param("ops", serde_json::json!(["Dropout"]))],
    );
    assert!(graph.find_node("id0").is_some());
    assert!(graph.find_node("drop_eval").is_none());

    let registry = PassRegistry::with_builtin_passes();
    let mut ctx = common::context();
    let config = PassConfig::new(REMOVE_IDENTITY).with_param("ops", serde_json::json!(["Relu"]));
    let err = PassOrchestrator::new(&registry)
        .run(&mut identity_chain(), &mut ctx, &[config])
        .unwrap_err();
    assert!(matches!(err, PassError::InvalidParameter { param, .. } if param == "ops"));
}
