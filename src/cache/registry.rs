use crate::cache::CacheError;
use crate::cache::fingerprint::{FingerprintAlgorithm, GraphFingerprints};
use crate::config::FingerprintConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One known model: fingerprints computed by an earlier run, and the cache key
/// they map to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub target: String,
    #[serde(default)]
    pub node_outputs: Option<String>,
    #[serde(default)]
    pub boundary: Option<String>,
    #[serde(default)]
    pub node_count: Option<usize>,
    #[serde(default)]
    pub file_hash: Option<String>,
    pub cache_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryMatch {
    Fingerprint(FingerprintAlgorithm),
    FileHash,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FingerprintRegistry {
    entries: Vec<RegistryEntry>,
}

impl FingerprintRegistry {
    pub fn new(entries: Vec<RegistryEntry>) -> Self {
        Self { entries }
    }

    pub fn from_json_file(path: &Path) -> Result<Self, CacheError> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn push(&mut self, entry: RegistryEntry) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any entry for `target` can match on a file hash.
    pub fn wants_file_hash(&self, target: &str) -> bool {
        self.entries
            .iter()
            .any(|x| x.target == target && x.file_hash.is_some())
    }

    /// Tries node-output fingerprints, then boundary fingerprints, then the
    /// file hash. The first entry in file order wins within each stage.
    pub fn lookup(
        &self,
        target: &str,
        fingerprints: &GraphFingerprints,
        file_hash: Option<&str>,
        options: &FingerprintConfig,
    ) -> Result<Option<(&RegistryEntry, RegistryMatch)>, CacheError> {
        let candidates: Vec<&RegistryEntry> = self.entries.iter().filter(|x| x.target == target).collect();
        if candidates.is_empty() {
            if options.require_registry_target {
                return Err(CacheError::RegistryTargetNotFound(target.to_string()));
            }
            return Ok(None);
        }

        if let Some(entry) = candidates
            .iter()
            .find(|x| x.node_outputs.as_deref() == Some(fingerprints.node_outputs.as_str()))
        {
            return Ok(Some((*entry, RegistryMatch::Fingerprint(FingerprintAlgorithm::NodeOutputs))));
        }
        if let Some(entry) = candidates.iter().find(|x| {
            x.boundary.as_deref() == Some(fingerprints.boundary.as_str())
                && (!options.match_node_count || x.node_count == Some(fingerprints.node_count))
        }) {
            return Ok(Some((*entry, RegistryMatch::Fingerprint(FingerprintAlgorithm::Boundary))));
        }
        if let Some(hash) = file_hash {
            if let Some(entry) = candidates.iter().find(|x| x.file_hash.as_deref() == Some(hash)) {
                return Ok(Some((*entry, RegistryMatch::FileHash)));
            }
        }
        Ok(None)
    }
}
