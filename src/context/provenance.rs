use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Maps each synthesized node to the original nodes it was derived from.
///
/// Recording is transitive: when a node derived from `a` is itself rewritten, the
/// new node traces back to `a`'s origins rather than to the intermediate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceMap {
    origins: BTreeMap<String, BTreeSet<String>>,
}

impl ProvenanceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record<S: AsRef<str>>(&mut self, node: &str, derived_from: impl IntoIterator<Item = S>) {
        let mut resolved = BTreeSet::new();
        for origin in derived_from {
            let origin = origin.as_ref();
            match self.origins.get(origin) {
                Some(inner) => resolved.extend(inner.iter().cloned()),
                None => {
                    resolved.insert(origin.to_string());
                }
            }
        }
        resolved.remove(node);
        if !resolved.is_empty() {
            self.origins.entry(node.to_string()).or_default().extend(resolved);
        }
    }

    pub fn origins(&self, node: &str) -> Option<&BTreeSet<String>> {
        self.origins.get(node)
    }

    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.origins.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_are_transitive() {
        let mut map = ProvenanceMap::new();
        map.record("fused", ["mm", "add"]);
        map.record("folded", ["fused", "relu"]);
        let origins: Vec<_> = map.origins("folded").unwrap().iter().cloned().collect();
        assert_eq!(origins, vec!["add", "mm", "relu"]);
    }

    #[test]
    fn renaming_in_place_keeps_origins() {
        let mut map = ProvenanceMap::new();
        map.record("y", ["a"]);
        map.record("y", ["y"]);
        assert_eq!(map.origins("y").unwrap().len(), 1);
    }
}
