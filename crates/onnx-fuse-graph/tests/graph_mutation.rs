use onnx_fuse_graph::onnx::{
    AttributeProto, GraphProto, ModelProto, NodeProto, StringStringEntryProto, TensorProto, TensorShapeProto, TypeProto,
    ValueInfoProto, attribute_type, tensor_shape_proto, type_proto,
};
use onnx_fuse_graph::{Attribute, ConstTensor, DType, Dimension, Graph, GraphError, Node, TensorInfo};
use prost::Message;

fn chain_graph() -> Graph {
    let mut graph = Graph::new("chain");
    graph.add_input("x", TensorInfo::new(DType::F32, &[2, 3])).unwrap();
    graph
        .add_initializer("b", ConstTensor::from_vec(vec![1.0f32, 2.0, 3.0], vec![3]).unwrap())
        .unwrap();
    graph
        .add_node(Node::new("Add").with_inputs(["x", "b"]).with_outputs(["sum"]))
        .unwrap();
    graph
        .add_node(Node::new("Relu").with_inputs(["sum"]).with_outputs(["y"]))
        .unwrap();
    graph.add_output("y");
    graph
}

#[test]
fn resolve_infers_elementwise_shapes() {
    let mut graph = chain_graph();
    assert!(graph.needs_resolve());
    graph.resolve().unwrap();
    assert!(!graph.needs_resolve());
    let info = graph.tensor_info("y").unwrap();
    assert_eq!(info.dtype, Some(DType::F32));
    assert_eq!(info.static_shape(), Some(vec![2, 3]));
}

#[test]
fn resolve_refreshes_reproduced_edges() {
    let mut graph = chain_graph();
    graph.add_input("wide", TensorInfo::new(DType::F16, &[4])).unwrap();
    graph.resolve().unwrap();
    assert_eq!(graph.tensor_info("y").unwrap().static_shape(), Some(vec![2, 3]));

    let relu = graph.producer("y").unwrap();
    graph.remove_node(relu).unwrap();
    graph
        .add_node(Node::new("Neg").with_inputs(["wide"]).with_outputs(["y"]))
        .unwrap();
    graph.resolve().unwrap();
    let info = graph.tensor_info("y").unwrap();
    assert_eq!(info.dtype, Some(DType::F16));
    assert_eq!(info.static_shape(), Some(vec![4]));
}

#[test]
fn oversized_tensor_is_rejected() {
    let result = ConstTensor::new(DType::F32, vec![usize::MAX, 2], vec![]);
    assert!(matches!(result, Err(onnx_fuse_graph::TensorError::ShapeOverflow(_))));
}

#[test]
fn duplicate_producer_is_rejected() {
    let mut graph = chain_graph();
    let err = graph
        .add_node(Node::new("Relu").with_inputs(["x"]).with_outputs(["sum"]))
        .unwrap_err();
    assert!(matches!(err, GraphError::DuplicateEdge(name) if name == "sum"));
}

#[test]
fn dangling_reference_fails_resolve() {
    let mut graph = chain_graph();
    let relu = graph.find_node("y").unwrap();
    graph.set_node_input(relu, 0, "missing").unwrap();
    assert!(matches!(graph.resolve(), Err(GraphError::DanglingEdge { .. })));
}

#[test]
fn topological_order_follows_edges() {
    let graph = chain_graph();
    let order = graph.topological_order().unwrap();
    let names: Vec<_> = order.iter().map(|x| graph.node(*x).unwrap().name.clone()).collect();
    assert_eq!(names, vec!["sum", "y"]);
}

#[test]
fn dead_nodes_are_eliminated() {
    let mut graph = chain_graph();
    graph
        .add_node(Node::new("Neg").with_inputs(["sum"]).with_outputs(["unused"]))
        .unwrap();
    graph
        .add_node(Node::new("Neg").with_inputs(["unused"]).with_outputs(["unused2"]))
        .unwrap();
    assert_eq!(graph.eliminate_dead_nodes().unwrap(), 2);
    assert_eq!(graph.node_count(), 2);
}

#[test]
fn literal_detection() {
    let mut graph = chain_graph();
    graph
        .add_node(
            Node::new("Constant")
                .with_outputs(["c"])
                .with_attribute("value", Attribute::Tensor(ConstTensor::scalar(4i64))),
        )
        .unwrap();
    assert!(graph.is_literal("b"));
    assert!(graph.is_literal("c"));
    assert!(!graph.is_literal("x"));
    assert!(!graph.is_literal("sum"));
    assert_eq!(graph.literal("c").unwrap().to_vec::<i64>().unwrap(), vec![4]);
}

#[test]
fn onnx_model_import() {
    let tensor_type = |elem_type: i32, dims: Vec<tensor_shape_proto::dimension::Value>| TypeProto {
        value: Some(type_proto::Value::TensorType(type_proto::Tensor {
            elem_type,
            shape: Some(TensorShapeProto {
                dim: dims
                    .into_iter()
                    .map(|x| tensor_shape_proto::Dimension { value: Some(x) })
                    .collect(),
            }),
        })),
    };
    use tensor_shape_proto::dimension::Value as Dim;
    let model = ModelProto {
        ir_version: 8,
        opset_import: vec![],
        producer_name: "test".to_string(),
        metadata_props: vec![StringStringEntryProto {
            key: "cache_key".to_string(),
            value: "abc".to_string(),
        }],
        graph: Some(GraphProto {
            name: "g".to_string(),
            node: vec![NodeProto {
                input: vec!["x".to_string(), "w".to_string()],
                output: vec!["y".to_string()],
                name: "mul".to_string(),
                op_type: "Mul".to_string(),
                domain: String::new(),
                attribute: vec![AttributeProto {
                    name: "tag".to_string(),
                    r#type: attribute_type::STRING,
                    s: b"hello".to_vec(),
                    ..Default::default()
                }],
            }],
            initializer: vec![TensorProto {
                dims: vec![2],
                data_type: DType::F32.onnx_code(),
                float_data: vec![0.5, 1.5],
                name: "w".to_string(),
                ..Default::default()
            }],
            input: vec![ValueInfoProto {
                name: "x".to_string(),
                r#type: Some(tensor_type(1, vec![Dim::DimParam("N".to_string()), Dim::DimValue(2)])),
            }],
            output: vec![ValueInfoProto {
                name: "y".to_string(),
                r#type: Some(tensor_type(1, vec![])),
            }],
            value_info: vec![],
        }),
    };
    let graph = Graph::from_onnx_bytes(&model.encode_to_vec()).unwrap();
    assert_eq!(graph.metadata("cache_key"), Some("abc"));
    assert_eq!(graph.inputs(), &["x".to_string()]);
    assert_eq!(graph.outputs(), &["y".to_string()]);
    assert_eq!(
        graph.tensor_info("x").unwrap().shape,
        Some(vec![Dimension::Unknown("N".to_string()), Dimension::Known(2)])
    );
    let mul = graph.node(graph.find_node("mul").unwrap()).unwrap();
    assert_eq!(mul.attribute_string("tag"), Some("hello"));
    assert_eq!(graph.initializer("w").unwrap().to_vec::<f32>().unwrap(), vec![0.5, 1.5]);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.onnx");
    std::fs::write(&path, model.encode_to_vec()).unwrap();
    let loaded = Graph::from_onnx_file(&path).unwrap();
    assert_eq!(loaded.source_path(), Some(path.as_path()));
    assert_eq!(loaded.node_count(), 1);
}

#[test]
fn truncated_model_is_rejected() {
    let _ = env_logger::builder().is_test(true).try_init();
    assert!(Graph::from_onnx_bytes(&[0x0a, 0xff]).is_err());
}
