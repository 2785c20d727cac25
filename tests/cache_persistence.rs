mod common;

use onnx_fuse::cache::fingerprint::{FingerprintAlgorithm, GraphFingerprints};
use onnx_fuse::cache::registry::{FingerprintRegistry, RegistryEntry};
use onnx_fuse::cache::state::{CONFIG_SNAPSHOT_FILE, CONTEXT_STATE_FILE};
use onnx_fuse::cache::{CacheError, CacheKeySource, resolve_cache_key};
use onnx_fuse::graph::{DType, Graph, Node, TensorInfo};
use onnx_fuse::passes::{FUSE_MATMUL_ADD, REMOVE_IDENTITY};
use onnx_fuse::{
    ActionKind, CacheBackend, CompilationContext, CompileConfig, Compiler, CompilerError, Pass, PassConfig, PassError,
    PassRegistry,
};

fn identity_graph(identity_name: &str, identity_output: &str) -> Graph {
    let mut graph = Graph::new("identity");
    graph.add_input("x", TensorInfo::new(DType::F32, &[2])).unwrap();
    graph
        .add_node(
            Node::new("Identity")
                .named(identity_name)
                .with_inputs(["x"])
                .with_outputs([identity_output]),
        )
        .unwrap();
    graph
        .add_node(Node::new("Relu").named("relu").with_inputs([identity_output]).with_outputs(["y"]))
        .unwrap();
    graph.add_output("y");
    graph.resolve().unwrap();
    graph
}

fn fingerprints(graph: &Graph) -> GraphFingerprints {
    GraphFingerprints::compute(graph, &CompileConfig::default().fingerprint.exclude_ops).unwrap()
}

#[test]
fn fingerprints_ignore_cosmetic_differences() {
    let a = fingerprints(&identity_graph("identity_0", "x_copy"));
    let b = fingerprints(&identity_graph("renamed", "x_alias"));
    assert_eq!(a, b);

    let mut renamed_output = identity_graph("identity_0", "x_copy");
    renamed_output
        .add_node(Node::new("Neg").named("neg").with_inputs(["y"]).with_outputs(["z"]))
        .unwrap();
    renamed_output.resolve().unwrap();
    assert_ne!(fingerprints(&renamed_output).node_outputs, a.node_outputs);
    // The boundary is unchanged: `z` is not a graph output.
    assert_eq!(fingerprints(&renamed_output).boundary, a.boundary);
}

fn relu_graph(width: usize) -> Graph {
    let mut graph = Graph::new("relu");
    graph.add_input("x", TensorInfo::new(DType::F32, &[width])).unwrap();
    graph
        .add_node(Node::new("Relu").named("relu").with_inputs(["x"]).with_outputs(["y"]))
        .unwrap();
    graph.add_output("y");
    graph.resolve().unwrap();
    graph
}

#[test]
fn fingerprints_follow_shapes() {
    let narrow = fingerprints(&relu_graph(2));
    let wide = fingerprints(&relu_graph(3));
    assert_eq!(narrow.node_count, wide.node_count);
    assert_ne!(narrow.node_outputs, wide.node_outputs);
    assert_ne!(narrow.boundary, wide.boundary);
    assert_eq!(narrow, fingerprints(&relu_graph(2)));
}

#[test]
fn cache_key_precedence() {
    let dir = tempfile::tempdir().unwrap();
    let mut graph = common::mlp_graph();
    let registry = FingerprintRegistry::default();
    let mut config = common::config_in(dir.path());

    let key = resolve_cache_key(&graph, &config, &registry).unwrap();
    assert_eq!(key.source, CacheKeySource::Fingerprint);
    assert_eq!(key.key, fingerprints(&graph).node_outputs);

    let model = dir.path().join("model.onnx");
    std::fs::write(&model, b"model bytes").unwrap();
    graph.set_source_path(&model);
    config.hash_model_file = true;
    let key = resolve_cache_key(&graph, &config, &registry).unwrap();
    assert_eq!(key.source, CacheKeySource::ModelFile);
    assert_eq!(key.key.len(), 64);

    graph.set_metadata("cache_key", "mlp v1");
    let key = resolve_cache_key(&graph, &config, &registry).unwrap();
    assert_eq!(key.source, CacheKeySource::GraphMetadata);
    assert_eq!(key.key, "mlp_v1");

    config.cache_key = Some("explicit/key".to_string());
    let key = resolve_cache_key(&graph, &config, &registry).unwrap();
    assert_eq!(key.source, CacheKeySource::Config);
    assert_eq!(key.key, "explicit_key");
}

fn entry(target: &str, cache_key: &str) -> RegistryEntry {
    RegistryEntry {
        target: target.to_string(),
        node_outputs: None,
        boundary: None,
        node_count: None,
        file_hash: None,
        cache_key: cache_key.to_string(),
    }
}

#[test]
fn registry_lookup_order() {
    let graph = common::mlp_graph();
    let config = CompileConfig::default();
    let fps = fingerprints(&graph);

    let boundary = RegistryEntry {
        boundary: Some(fps.boundary.clone()),
        node_count: Some(fps.node_count),
        ..entry("cpu", "by_boundary")
    };
    let node_outputs = RegistryEntry {
        node_outputs: Some(fps.node_outputs.clone()),
        ..entry("cpu", "by_outputs")
    };
    let other_target = RegistryEntry {
        node_outputs: Some(fps.node_outputs.clone()),
        ..entry("npu", "other_target")
    };

    let registry = FingerprintRegistry::new(vec![other_target.clone(), boundary.clone(), node_outputs]);
    let key = resolve_cache_key(&graph, &config, &registry).unwrap();
    assert_eq!(key.key, "by_outputs");
    assert_eq!(key.source, CacheKeySource::Registry(FingerprintAlgorithm::NodeOutputs));

    let registry = FingerprintRegistry::new(vec![boundary.clone()]);
    let key = resolve_cache_key(&graph, &config, &registry).unwrap();
    assert_eq!(key.source, CacheKeySource::Registry(FingerprintAlgorithm::Boundary));

    let stale_count = RegistryEntry {
        node_count: Some(fps.node_count + 1),
        ..boundary
    };
    let registry = FingerprintRegistry::new(vec![stale_count]);
    let key = resolve_cache_key(&graph, &config, &registry).unwrap();
    assert_eq!(key.source, CacheKeySource::Fingerprint);

    let mut strict = config.clone();
    strict.fingerprint.require_registry_target = true;
    let registry = FingerprintRegistry::new(vec![other_target]);
    assert!(matches!(
        resolve_cache_key(&graph, &strict, &registry),
        Err(CacheError::RegistryTargetNotFound(target)) if target == "cpu"
    ));
}

#[test]
fn registry_file_hash_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("model.onnx");
    std::fs::write(&model, b"model bytes").unwrap();
    let mut graph = common::mlp_graph();
    graph.set_source_path(&model);
    let hash = onnx_fuse::cache::fingerprint::file_hash(&model).unwrap();

    let registry_path = dir.path().join("registry.json");
    let registry = vec![RegistryEntry {
        file_hash: Some(hash),
        ..entry("cpu", "by_file")
    }];
    std::fs::write(&registry_path, serde_json::to_vec(&registry).unwrap()).unwrap();

    let mut config = CompileConfig::default();
    config.fingerprint.registry_path = Some(registry_path);
    let compiler = Compiler::from_config(PassRegistry::with_builtin_passes(), &config).unwrap();
    assert_eq!(compiler.fingerprints().entries().len(), 1);
    let key = resolve_cache_key(&graph, &config, compiler.fingerprints()).unwrap();
    assert_eq!(key.source, CacheKeySource::RegistryFileHash);
    assert_eq!(key.key, "by_file");
}

fn fuse_config(dir: &std::path::Path) -> CompileConfig {
    common::config_in(dir).with_pass(PassConfig::new(FUSE_MATMUL_ADD))
}

#[test]
fn second_compile_runs_no_passes() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let config = fuse_config(dir.path());
    let compiler = Compiler::default();

    let mut graph = common::mlp_graph();
    let mut first = compiler.compile(&mut graph, &config).unwrap();
    assert!(!first.cache_hit);
    assert_eq!(first.passes_run, 1);
    assert!(graph.find_node("matmul").is_none());

    let mut fresh = common::mlp_graph();
    let mut second = compiler.compile(&mut fresh, &config).unwrap();
    assert!(second.cache_hit);
    assert_eq!(second.passes_run, 0);
    assert_eq!(second.cache_key, first.cache_key);
    // A cache hit leaves the graph alone.
    assert!(fresh.find_node("matmul").is_some());

    assert_eq!(second.context.meta_defs(), first.context.meta_defs());
    let expected = first.context.get_const_data("z/weights", true).unwrap().unwrap().to_vec();
    assert_eq!(second.context.get_const_data("z/weights", false).unwrap().unwrap(), expected.as_slice());
}

#[test]
fn tool_version_change_recompiles() {
    let dir = tempfile::tempdir().unwrap();
    let compiler = Compiler::default();
    let mut config = fuse_config(dir.path());
    config.tool_versions.insert("backend".to_string(), "1.0".to_string());
    compiler.compile(&mut common::mlp_graph(), &config).unwrap();

    config.tool_versions.insert("backend".to_string(), "1.1".to_string());
    let result = compiler.compile(&mut common::mlp_graph(), &config).unwrap();
    assert!(!result.cache_hit);
    assert_eq!(result.passes_run, 1);

    // The recompile replaced the entry.
    let result = compiler.compile(&mut common::mlp_graph(), &config).unwrap();
    assert!(result.cache_hit);
}

#[test]
fn target_change_recompiles() {
    let dir = tempfile::tempdir().unwrap();
    let compiler = Compiler::default();
    let mut config = fuse_config(dir.path());
    config.target = "DPU_A".to_string();
    compiler.compile(&mut common::mlp_graph(), &config).unwrap();

    config.target = "DPU_B".to_string();
    let result = compiler.compile(&mut common::mlp_graph(), &config).unwrap();
    assert!(!result.cache_hit);
    assert_eq!(result.passes_run, 1);
    assert_eq!(result.context.target(), "DPU_B");
    assert!(result.context.meta_defs().iter().all(|x| x.device == "DPU_B"));

    let result = compiler.compile(&mut common::mlp_graph(), &config).unwrap();
    assert!(result.cache_hit);
    assert_eq!(result.context.target(), "DPU_B");
    assert!(result.context.meta_defs().iter().all(|x| x.device == "DPU_B"));
}

#[test]
fn corrupt_entry_is_a_miss() {
    let dir = tempfile::tempdir().unwrap();
    let compiler = Compiler::default();
    let config = fuse_config(dir.path());
    let first = compiler.compile(&mut common::mlp_graph(), &config).unwrap();

    let entry = dir.path().join(&first.cache_key.key);
    std::fs::write(entry.join(CONTEXT_STATE_FILE), b"{ not json").unwrap();
    let second = compiler.compile(&mut common::mlp_graph(), &config).unwrap();
    assert!(!second.cache_hit);
    assert_eq!(second.passes_run, 1);

    let third = compiler.compile(&mut common::mlp_graph(), &config).unwrap();
    assert!(third.cache_hit);
}

#[test]
fn disabled_cache_always_compiles() {
    let dir = tempfile::tempdir().unwrap();
    let compiler = Compiler::default();
    let mut config = fuse_config(dir.path());
    config.enable_cache = false;
    for _ in 0..2 {
        let result = compiler.compile(&mut common::mlp_graph(), &config).unwrap();
        assert!(!result.cache_hit);
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn persisted_config_has_no_secrets() {
    let dir = tempfile::tempdir().unwrap();
    let compiler = Compiler::default();
    let mut config = fuse_config(dir.path());
    config.encryption_key = Some("hunter2".to_string());
    let result = compiler.compile(&mut common::mlp_graph(), &config).unwrap();

    let snapshot = std::fs::read(dir.path().join(&result.cache_key.key).join(CONFIG_SNAPSHOT_FILE)).unwrap();
    let restored: CompileConfig = serde_json::from_slice(&snapshot).unwrap();
    assert_eq!(restored.encryption_key, None);
    assert_eq!(restored.passes, config.passes);
    assert!(!String::from_utf8_lossy(&snapshot).contains("hunter2"));
}

#[test]
fn compressed_archive_backend() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("cache.bin");
    let mut config = fuse_config(dir.path());
    config.cache_backend = CacheBackend::Archive {
        path: archive.clone(),
        compress: true,
    };
    let compiler = Compiler::default();

    assert!(!compiler.compile(&mut common::mlp_graph(), &config).unwrap().cache_hit);
    let bytes = std::fs::read(&archive).unwrap();
    assert_eq!(&bytes[..2], &[0x1f, 0x8b]);
    assert!(compiler.compile(&mut common::mlp_graph(), &config).unwrap().cache_hit);

    // A different model shares the archive under its own key.
    let mut other = common::mlp_graph();
    other.set_metadata("cache_key", "other");
    assert!(!compiler.compile(&mut other, &config).unwrap().cache_hit);
    assert!(compiler.compile(&mut common::mlp_graph(), &config).unwrap().cache_hit);

    std::fs::write(&archive, b"garbage").unwrap();
    assert!(!compiler.compile(&mut common::mlp_graph(), &config).unwrap().cache_hit);
    assert!(compiler.compile(&mut common::mlp_graph(), &config).unwrap().cache_hit);
}

struct Explode;

impl Pass for Explode {
    fn name(&self) -> &str {
        "explode"
    }

    fn actions(&self) -> Vec<ActionKind> {
        vec![ActionKind::Graph]
    }

    fn graph_action(&mut self, _action: usize, _graph: &mut Graph, _ctx: &mut CompilationContext) -> Result<bool, PassError> {
        Err(PassError::Custom {
            pass: "explode".to_string(),
            source: anyhow::anyhow!("unsupported model"),
        })
    }
}

fn exploding_compiler() -> Compiler {
    let mut passes = PassRegistry::with_builtin_passes();
    passes.register("explode", || Box::new(Explode));
    Compiler::new(passes, FingerprintRegistry::default())
}

#[test]
fn fatal_pass_error_falls_back_to_the_original_graph() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fuse_config(dir.path()).with_pass(PassConfig::new("explode"));
    config.skip_on_fatal = true;
    let compiler = exploding_compiler();

    let mut graph = common::mlp_graph();
    let result = compiler.compile(&mut graph, &config).unwrap();
    assert!(result.fell_back);
    assert!(result.context.meta_defs().is_empty());
    assert_eq!(common::node_names(&graph), vec!["add", "matmul", "relu"]);
    // Nothing is cached for a failed compile.
    assert!(!dir.path().join(&result.cache_key.key).join(CONTEXT_STATE_FILE).exists());

    config.skip_on_fatal = false;
    let err = compiler.compile(&mut graph, &config).unwrap_err();
    assert!(matches!(err, CompilerError::PassError(PassError::Custom { .. })));
    assert!(graph.find_node("matmul").is_some());
}

#[test]
fn config_round_trips_through_json() {
    let json = r#"{
        "passes": [
            {"name": "remove_identity"},
            {"name": "fuse", "plugin": "fuse_matmul_add", "gc": false}
        ],
        "target": "npu",
        "cache_backend": {"kind": "archive", "path": "cache.bin", "compress": true}
    }"#;
    let config = CompileConfig::from_json_str(json).unwrap();
    assert_eq!(config.passes[0].plugin_name(), REMOVE_IDENTITY);
    assert_eq!(config.passes[1].plugin_name(), FUSE_MATMUL_ADD);
    assert!(config.passes[0].enabled);
    assert!(!config.passes[1].gc);
    assert!(config.enable_cache);
    assert!(matches!(config.cache_backend, CacheBackend::Archive { compress: true, .. }));
}
