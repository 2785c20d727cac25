use crate::cache::CacheError;
use crate::cache::storage::CacheStorage;
use crate::config::CompileConfig;
use crate::context::{CompilationContext, ContextState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CONTEXT_STATE_FILE: &str = "context.json";
pub const CONST_BLOB_FILE: &str = "const.bin";
pub const CONFIG_SNAPSHOT_FILE: &str = "config.json";

/// Bumped whenever the layout of persisted state changes.
pub const STATE_FORMAT_VERSION: u32 = 1;

/// Versions that must all match for cached state to be reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolVersions {
    pub compiler: String,
    pub state_format: u32,
    pub tools: BTreeMap<String, String>,
}

impl ToolVersions {
    pub fn current(config: &CompileConfig) -> Self {
        Self {
            compiler: env!("CARGO_PKG_VERSION").to_string(),
            state_format: STATE_FORMAT_VERSION,
            tools: config.tool_versions.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub versions: ToolVersions,
    pub context: ContextState,
}

/// Writes the constant blob, a config snapshot without secrets, and the context
/// state. The state file goes last and marks the entry complete.
pub fn save_state(
    storage: &mut dyn CacheStorage,
    ctx: &mut CompilationContext,
    config: &CompileConfig,
) -> Result<(), CacheError> {
    let (context, blob) = ctx.export_state()?;
    let state = PersistedState {
        versions: ToolVersions::current(config),
        context,
    };
    storage.write(CONST_BLOB_FILE, &blob)?;
    storage.write(CONFIG_SNAPSHOT_FILE, &serde_json::to_vec_pretty(&config.stripped_for_persistence())?)?;
    storage.write(CONTEXT_STATE_FILE, &serde_json::to_vec_pretty(&state)?)?;
    storage.commit()?;
    log::debug!("Persisted {} bytes of constants for {}", blob.len(), state.context.cache_key);
    Ok(())
}

/// Restores a context from `storage`. `Ok(None)` when nothing was stored.
pub fn load_state(storage: &dyn CacheStorage, config: &CompileConfig) -> Result<Option<CompilationContext>, CacheError> {
    let Some(bytes) = storage.read(CONTEXT_STATE_FILE)? else {
        return Ok(None);
    };
    let state: PersistedState = serde_json::from_slice(&bytes)?;
    let current = ToolVersions::current(config);
    if state.versions != current {
        return Err(CacheError::VersionMismatch {
            cached: Box::new(state.versions),
            current: Box::new(current),
        });
    }
    if state.context.target != config.target {
        return Err(CacheError::TargetMismatch {
            cached: state.context.target,
            current: config.target.clone(),
        });
    }
    let blob = storage
        .read(CONST_BLOB_FILE)?
        .ok_or(CacheError::Incomplete(CONST_BLOB_FILE))?;
    Ok(Some(CompilationContext::from_state(config, state.context, blob)?))
}
