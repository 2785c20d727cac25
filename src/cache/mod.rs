//! Cache keys and persisted compilation state.
//!
//! A compile run is identified by a cache key. The key is taken from the first
//! available source: an explicit key in the config, a graph metadata entry, the
//! hash of the model file (if enabled), or a fingerprint of the graph, looked up
//! in the fingerprint registry first.
pub mod fingerprint;
pub mod lock;
pub mod registry;
pub mod state;
pub mod storage;

use crate::config::{CacheBackend, CompileConfig};
use crate::context::ContextError;
use fingerprint::{FingerprintAlgorithm, GraphFingerprints, file_hash};
use onnx_fuse_graph::{Graph, GraphError};
use registry::{FingerprintRegistry, RegistryMatch};
use state::ToolVersions;
use std::path::{Path, PathBuf};
use storage::{ArchiveStorage, CacheStorage, DirectoryStorage};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache I/O failed")]
    Io(#[from] std::io::Error),
    #[error("Malformed cache metadata")]
    Json(#[from] serde_json::Error),
    #[error("Malformed cache archive: {0}")]
    Archive(String),
    #[error("Cached state was produced by {cached:?}, current tools are {current:?}")]
    VersionMismatch {
        cached: Box<ToolVersions>,
        current: Box<ToolVersions>,
    },
    #[error("Cached state was compiled for target \"{cached}\", not \"{current}\"")]
    TargetMismatch { cached: String, current: String },
    #[error("Cache entry is missing \"{0}\"")]
    Incomplete(&'static str),
    #[error("Fingerprint registry has no entry for target \"{0}\"")]
    RegistryTargetNotFound(String),
    #[error(transparent)]
    ContextError(#[from] ContextError),
    #[error(transparent)]
    GraphError(#[from] GraphError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum CacheKeySource {
    Config,
    GraphMetadata,
    ModelFile,
    Registry(FingerprintAlgorithm),
    RegistryFileHash,
    Fingerprint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub key: String,
    pub source: CacheKeySource,
}

/// Keys become directory and archive entry names.
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
        .collect()
}

pub fn resolve_cache_key(
    graph: &Graph,
    config: &CompileConfig,
    registry: &FingerprintRegistry,
) -> Result<CacheKey, CacheError> {
    let key = |key: &str, source| CacheKey {
        key: sanitize(key),
        source,
    };
    if let Some(explicit) = config.cache_key.as_deref().filter(|x| !x.is_empty()) {
        return Ok(key(explicit, CacheKeySource::Config));
    }
    if let Some(meta) = graph.metadata(&config.cache_key_metadata).filter(|x| !x.is_empty()) {
        return Ok(key(meta, CacheKeySource::GraphMetadata));
    }
    let model_hash = |path: &Path| match file_hash(path) {
        Ok(hash) => Some(hash),
        Err(err) => {
            log::warn!("Unable to hash model file {}: {err}", path.display());
            None
        }
    };
    if config.hash_model_file {
        if let Some(hash) = graph.source_path().and_then(model_hash) {
            return Ok(key(&hash, CacheKeySource::ModelFile));
        }
    }

    let fingerprints = GraphFingerprints::compute(graph, &config.fingerprint.exclude_ops)?;
    let file_hash = if registry.wants_file_hash(&config.target) {
        graph.source_path().and_then(model_hash)
    } else {
        None
    };
    let found = registry.lookup(&config.target, &fingerprints, file_hash.as_deref(), &config.fingerprint)?;
    Ok(match found {
        Some((entry, RegistryMatch::Fingerprint(algorithm))) => key(&entry.cache_key, CacheKeySource::Registry(algorithm)),
        Some((entry, RegistryMatch::FileHash)) => key(&entry.cache_key, CacheKeySource::RegistryFileHash),
        None => key(&fingerprints.node_outputs, CacheKeySource::Fingerprint),
    })
}

/// Path guarded by the per-location lock: the key directory, or the archive file.
pub fn cache_location(config: &CompileConfig, key: &CacheKey) -> PathBuf {
    match &config.cache_backend {
        CacheBackend::Directory => config.cache_dir.join(&key.key),
        CacheBackend::Archive { path, .. } => path.clone(),
    }
}

pub fn open_storage(config: &CompileConfig, key: &CacheKey) -> Result<Box<dyn CacheStorage>, CacheError> {
    Ok(match &config.cache_backend {
        CacheBackend::Directory => Box::new(DirectoryStorage::new(config.cache_dir.join(&key.key))),
        CacheBackend::Archive { path, compress } => {
            Box::new(ArchiveStorage::open(path, *compress)?.scoped(&key.key))
        }
    })
}
