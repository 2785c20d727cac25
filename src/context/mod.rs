//! Per-compile mutable state shared by every pass of one run.
pub mod const_data;
pub mod meta_def;
pub mod provenance;
pub mod telemetry;

use crate::config::CompileConfig;
use const_data::{ConstDataLayout, ConstDataStore, ConstRegion};
use meta_def::MetaDef;
use onnx_fuse_graph::{Attribute, DType, Graph, GraphError, Node, NodeId, TensorError};
use provenance::ProvenanceMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use telemetry::Telemetry;

/// Domain of the nodes that stand in for fused subgraphs.
pub const FUSED_DOMAIN: &str = "com.onnx_fuse";
/// Attribute on a fused node holding its index into the context's MetaDef list.
pub const METADEF_INDEX_ATTR: &str = "metadef_index";
/// Attribute on a `Constant` node naming the const-data region it stands for.
pub const CONST_DATA_ATTR: &str = "const_data";

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Unknown constant \"{0}\"")]
    UnknownConst(String),
    #[error("Constant \"{0}\" already exists")]
    DuplicateConst(String),
    #[error("Constant \"{name}\" expects {expected} bytes, got {actual}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("Constant \"{0}\" lies outside the constant blob")]
    RegionOutOfBounds(String),
    #[error("Filling lazy constant \"{name}\" failed: {reason}")]
    LazyFill { name: String, reason: String },
    #[error("No fix info recorded for \"{0}\"")]
    MissingFixInfo(String),
    #[error("Fused subgraph \"{op_type}\" references unknown node \"{node}\"")]
    UnknownMember { op_type: String, node: String },
    #[error("Fused subgraph \"{op_type}\" output \"{edge}\" is not produced by its members")]
    UnproducedOutput { op_type: String, edge: String },
    #[error("Fused subgraph \"{op_type}\" hides edge \"{edge}\" which is still used outside it")]
    HiddenEdge { op_type: String, edge: String },
    #[error(transparent)]
    GraphError(#[from] GraphError),
    #[error(transparent)]
    TensorError(#[from] TensorError),
}

/// Serializable part of a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextState {
    pub cache_key: String,
    pub target: String,
    pub meta_defs: Vec<MetaDef>,
    pub fix_info: BTreeMap<String, i64>,
    pub provenance: ProvenanceMap,
    pub const_layout: ConstDataLayout,
}

#[derive(Debug)]
pub struct CompilationContext {
    config: CompileConfig,
    cache_key: String,
    const_data: ConstDataStore,
    fix_info: BTreeMap<String, i64>,
    meta_defs: Vec<MetaDef>,
    provenance: ProvenanceMap,
    current_pass: Option<String>,
    telemetry: Telemetry,
}

impl CompilationContext {
    pub fn new(config: &CompileConfig, cache_key: &str) -> Self {
        Self {
            config: config.clone(),
            cache_key: cache_key.to_string(),
            const_data: ConstDataStore::new(),
            fix_info: BTreeMap::new(),
            meta_defs: vec![],
            provenance: ProvenanceMap::new(),
            current_pass: None,
            telemetry: Telemetry::default(),
        }
    }

    pub fn config(&self) -> &CompileConfig {
        &self.config
    }

    pub fn provider_option(&self, key: &str) -> Option<&str> {
        self.config.provider_option(key)
    }

    pub fn target(&self) -> &str {
        &self.config.target
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.config.cache_dir.join(&self.cache_key)
    }

    pub fn current_pass(&self) -> Option<&str> {
        self.current_pass.as_deref()
    }

    pub fn set_current_pass(&mut self, pass: Option<&str>) {
        self.current_pass = pass.map(str::to_string);
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn telemetry_mut(&mut self) -> &mut Telemetry {
        &mut self.telemetry
    }

    pub fn provenance(&self) -> &ProvenanceMap {
        &self.provenance
    }

    pub fn provenance_mut(&mut self) -> &mut ProvenanceMap {
        &mut self.provenance
    }

    pub fn const_data(&self) -> &ConstDataStore {
        &self.const_data
    }

    pub fn const_data_mut(&mut self) -> &mut ConstDataStore {
        &mut self.const_data
    }

    pub fn create_const(&mut self, name: &str, bytes: &[u8], shape: &[usize], dtype: DType) -> Result<(), ContextError> {
        self.const_data.create_const(name, bytes, shape, dtype)?;
        log::trace!("Created constant {name} ({} bytes)", bytes.len());
        Ok(())
    }

    pub fn create_lazy_const(
        &mut self,
        name: &str,
        size: usize,
        shape: &[usize],
        dtype: DType,
        fill: impl FnOnce(&mut [u8]) -> anyhow::Result<()> + Send + 'static,
    ) -> Result<(), ContextError> {
        self.const_data.create_lazy_const(name, size, shape, dtype, fill)
    }

    pub fn create_const_alias(&mut self, alias: &str, name: &str) -> Result<(), ContextError> {
        self.const_data.create_const_alias(alias, name)
    }

    pub fn has_const(&self, name: &str) -> bool {
        self.const_data.contains(name)
    }

    pub fn const_region(&self, name: &str) -> Result<&ConstRegion, ContextError> {
        self.const_data.region(name)
    }

    pub fn get_const_data(&mut self, name: &str, force: bool) -> Result<Option<&[u8]>, ContextError> {
        self.const_data.get_const_data(name, force)
    }

    pub fn materialize_all(&mut self) -> Result<(), ContextError> {
        self.const_data.materialize_all()
    }

    pub fn set_fix_info(&mut self, edge: &str, fix_point: i64) {
        self.fix_info.insert(edge.to_string(), fix_point);
    }

    pub fn get_fix_info(&self, edge: &str) -> Result<i64, ContextError> {
        self.fix_info
            .get(edge)
            .copied()
            .ok_or_else(|| ContextError::MissingFixInfo(edge.to_string()))
    }

    pub fn has_fix_info(&self, edge: &str) -> bool {
        self.fix_info.contains_key(edge)
    }

    pub fn meta_defs(&self) -> &[MetaDef] {
        &self.meta_defs
    }

    pub fn meta_defs_mut(&mut self) -> &mut [MetaDef] {
        &mut self.meta_defs
    }

    /// Replaces the member nodes of `meta_def` with one node in [`FUSED_DOMAIN`]
    /// and records the MetaDef. Returns the new node.
    pub fn append_fused_subgraph(&mut self, graph: &mut Graph, mut meta_def: MetaDef) -> Result<NodeId, ContextError> {
        let mut members = Vec::with_capacity(meta_def.nodes.len());
        for name in &meta_def.nodes {
            let id = graph.find_node(name).ok_or_else(|| ContextError::UnknownMember {
                op_type: meta_def.op_type.clone(),
                node: name.clone(),
            })?;
            members.push(id);
        }
        let member_set: HashSet<NodeId> = members.iter().copied().collect();

        let mut produced = HashSet::new();
        for id in &members {
            if let Some(node) = graph.node(*id) {
                produced.extend(node.outputs.iter().cloned());
            }
        }
        for edge in &meta_def.outputs {
            if !produced.contains(edge) {
                return Err(ContextError::UnproducedOutput {
                    op_type: meta_def.op_type.clone(),
                    edge: edge.clone(),
                });
            }
        }
        for edge in produced.iter().filter(|x| !meta_def.outputs.contains(x)) {
            let used_outside = graph.is_graph_output(edge)
                || graph.consumers(edge).iter().any(|x| !member_set.contains(x));
            if used_outside {
                return Err(ContextError::HiddenEdge {
                    op_type: meta_def.op_type.clone(),
                    edge: edge.clone(),
                });
            }
        }

        for input in &meta_def.inputs {
            if graph.is_literal(input) && !meta_def.constant_initializers.contains(input) {
                meta_def.constant_initializers.push(input.clone());
            }
        }
        if meta_def.device.is_empty() {
            meta_def.device = self.config.target.clone();
        }

        for id in members {
            graph.remove_node(id)?;
        }
        let index = self.meta_defs.len();
        let node = Node::new(&meta_def.op_type)
            .in_domain(FUSED_DOMAIN)
            .with_inputs(&meta_def.inputs)
            .with_outputs(&meta_def.outputs)
            .with_attribute(METADEF_INDEX_ATTR, Attribute::Int(index as i64))
            .with_attribute("device", Attribute::String(meta_def.device.clone()));
        let id = graph.add_node(node)?;
        let name = graph.node(id).map(|x| x.name.clone()).unwrap_or_default();
        self.provenance.record(&name, &meta_def.nodes);
        log::debug!(
            "Fused {} nodes into {} ({}) for {}",
            meta_def.nodes.len(),
            name,
            meta_def.op_type,
            meta_def.device
        );
        meta_def.id = name;
        self.meta_defs.push(meta_def);
        self.telemetry.count("fused_subgraphs");
        Ok(id)
    }

    /// Snapshot for persistence along with the constant blob. Lazy regions are
    /// materialized first.
    pub fn export_state(&mut self) -> Result<(ContextState, Vec<u8>), ContextError> {
        let (const_layout, blob) = self.const_data.export()?;
        Ok((
            ContextState {
                cache_key: self.cache_key.clone(),
                target: self.config.target.clone(),
                meta_defs: self.meta_defs.clone(),
                fix_info: self.fix_info.clone(),
                provenance: self.provenance.clone(),
                const_layout,
            },
            blob,
        ))
    }

    pub fn from_state(config: &CompileConfig, state: ContextState, blob: Vec<u8>) -> Result<Self, ContextError> {
        Ok(Self {
            config: config.clone(),
            cache_key: state.cache_key,
            const_data: ConstDataStore::restore(state.const_layout, blob)?,
            fix_info: state.fix_info,
            meta_defs: state.meta_defs,
            provenance: state.provenance,
            current_pass: None,
            telemetry: Telemetry::default(),
        })
    }
}
