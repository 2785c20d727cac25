use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unable to read config file")]
    Io(#[from] std::io::Error),
    #[error("Malformed config")]
    Json(#[from] serde_json::Error),
}

/// Free-form pass parameters as given in the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PassParams(pub BTreeMap<String, serde_json::Value>);

impl PassParams {
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|x| x.as_str())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(|x| x.as_bool())
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(|x| x.as_i64())
    }

    pub fn get_strings(&self, key: &str) -> Option<Vec<String>> {
        self.0
            .get(key)?
            .as_array()?
            .iter()
            .map(|x| x.as_str().map(str::to_string))
            .collect()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.0.insert(key.to_string(), value.into());
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassConfig {
    pub name: String,
    /// Registered pass to instantiate. Defaults to `name`, which lets one pass
    /// appear several times under different names.
    #[serde(default)]
    pub plugin: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Remove dead nodes after each action.
    #[serde(default = "default_true")]
    pub gc: bool,
    #[serde(default)]
    pub params: PassParams,
}

impl PassConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            plugin: None,
            enabled: true,
            gc: true,
            params: PassParams::default(),
        }
    }

    pub fn with_plugin(mut self, plugin: &str) -> Self {
        self.plugin = Some(plugin.to_string());
        self
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key, value);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn without_gc(mut self) -> Self {
        self.gc = false;
        self
    }

    pub fn plugin_name(&self) -> &str {
        self.plugin.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheBackend {
    /// One directory per cache key under `cache_dir`.
    #[default]
    Directory,
    /// Every key in a single CBOR archive file, optionally gzip-compressed.
    Archive { path: PathBuf, compress: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Operator types whose outputs do not contribute to the node-output fingerprint.
    pub exclude_ops: Vec<String>,
    /// Boundary fingerprint matches also require an equal node count.
    pub match_node_count: bool,
    /// Fail when the registry has no entry for the configured target.
    pub require_registry_target: bool,
    pub registry_path: Option<PathBuf>,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            exclude_ops: vec!["Identity".to_string(), "Dropout".to_string()],
            match_node_count: true,
            require_registry_target: false,
            registry_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    pub passes: Vec<PassConfig>,
    pub target: String,
    pub cache_dir: PathBuf,
    pub cache_key: Option<String>,
    /// Graph metadata entry consulted for a cache key.
    pub cache_key_metadata: String,
    pub hash_model_file: bool,
    pub enable_cache: bool,
    pub cache_backend: CacheBackend,
    pub fingerprint: FingerprintConfig,
    /// Leave the graph untouched instead of failing when a pass errors.
    pub skip_on_fatal: bool,
    pub provider_options: BTreeMap<String, String>,
    /// Versions of external tools that participate in cache validation.
    pub tool_versions: BTreeMap<String, String>,
    pub encryption_key: Option<String>,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            passes: vec![],
            target: "cpu".to_string(),
            cache_dir: PathBuf::from(".onnx_fuse_cache"),
            cache_key: None,
            cache_key_metadata: "cache_key".to_string(),
            hash_model_file: false,
            enable_cache: true,
            cache_backend: CacheBackend::Directory,
            fingerprint: FingerprintConfig::default(),
            skip_on_fatal: false,
            provider_options: BTreeMap::new(),
            tool_versions: BTreeMap::new(),
            encryption_key: None,
        }
    }
}

impl CompileConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn with_pass(mut self, pass: PassConfig) -> Self {
        self.passes.push(pass);
        self
    }

    pub fn provider_option(&self, key: &str) -> Option<&str> {
        self.provider_options.get(key).map(String::as_str)
    }

    /// Copy that is safe to write next to cached state.
    pub fn stripped_for_persistence(&self) -> Self {
        Self {
            encryption_key: None,
            ..self.clone()
        }
    }
}
