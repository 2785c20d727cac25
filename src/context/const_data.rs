//! One contiguous byte blob per compile run, carved into named regions.
use crate::context::ContextError;
use onnx_fuse_graph::DType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const CONST_ALIGNMENT: usize = 8;

type LazyFill = Box<dyn FnOnce(&mut [u8]) -> anyhow::Result<()> + Send>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstRegion {
    pub offset: usize,
    pub size: usize,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

/// Region table and alias table, i.e. everything but the bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstDataLayout {
    pub regions: BTreeMap<String, ConstRegion>,
    pub aliases: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct ConstDataStore {
    blob: Vec<u8>,
    layout: ConstDataLayout,
    pending: HashMap<String, LazyFill>,
    /// Regions whose fill failed, with the reason. They stay unreadable.
    failed: BTreeMap<String, String>,
}

impl std::fmt::Debug for ConstDataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConstDataStore")
            .field("bytes", &self.blob.len())
            .field("layout", &self.layout)
            .field("pending", &self.pending.keys().collect::<Vec<_>>())
            .field("failed", &self.failed)
            .finish()
    }
}

impl ConstDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a store from persisted parts. Every region must lie inside the blob
    /// and every alias must point at a region.
    pub fn restore(layout: ConstDataLayout, blob: Vec<u8>) -> Result<Self, ContextError> {
        for (name, region) in &layout.regions {
            let end = region.offset.checked_add(region.size);
            if end.is_none_or(|end| end > blob.len()) {
                return Err(ContextError::RegionOutOfBounds(name.clone()));
            }
        }
        for target in layout.aliases.values() {
            if !layout.regions.contains_key(target) {
                return Err(ContextError::UnknownConst(target.clone()));
            }
        }
        Ok(Self {
            blob,
            layout,
            pending: HashMap::new(),
            failed: BTreeMap::new(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.layout.regions.contains_key(name) || self.layout.aliases.contains_key(name)
    }

    /// `base`, or `base` with the first free numeric suffix.
    pub fn unique_name(&self, base: &str) -> String {
        if !self.contains(base) {
            return base.to_string();
        }
        let mut i = 1;
        loop {
            let candidate = format!("{base}.{i}");
            if !self.contains(&candidate) {
                return candidate;
            }
            i += 1;
        }
    }

    fn canonical<'a>(&'a self, name: &'a str) -> Result<&'a str, ContextError> {
        if let Some(target) = self.layout.aliases.get(name) {
            Ok(target)
        } else if self.layout.regions.contains_key(name) {
            Ok(name)
        } else {
            Err(ContextError::UnknownConst(name.to_string()))
        }
    }

    fn reserve(&mut self, name: &str, size: usize, shape: &[usize], dtype: DType) -> Result<usize, ContextError> {
        if self.contains(name) {
            return Err(ContextError::DuplicateConst(name.to_string()));
        }
        let offset = self.blob.len().next_multiple_of(CONST_ALIGNMENT);
        self.blob.resize(offset + size, 0);
        self.layout.regions.insert(
            name.to_string(),
            ConstRegion {
                offset,
                size,
                shape: shape.to_vec(),
                dtype,
            },
        );
        Ok(offset)
    }

    pub fn create_const(&mut self, name: &str, bytes: &[u8], shape: &[usize], dtype: DType) -> Result<(), ContextError> {
        let expected = shape.iter().product::<usize>() * dtype.size();
        if bytes.len() != expected {
            return Err(ContextError::SizeMismatch {
                name: name.to_string(),
                expected,
                actual: bytes.len(),
            });
        }
        let offset = self.reserve(name, bytes.len(), shape, dtype)?;
        self.blob[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Reserves `size` zeroed bytes; `fill` writes them the first time the region
    /// is force-read and is dropped afterwards.
    pub fn create_lazy_const(
        &mut self,
        name: &str,
        size: usize,
        shape: &[usize],
        dtype: DType,
        fill: impl FnOnce(&mut [u8]) -> anyhow::Result<()> + Send + 'static,
    ) -> Result<(), ContextError> {
        let expected = shape.iter().product::<usize>() * dtype.size();
        if size != expected {
            return Err(ContextError::SizeMismatch {
                name: name.to_string(),
                expected,
                actual: size,
            });
        }
        self.reserve(name, size, shape, dtype)?;
        self.pending.insert(name.to_string(), Box::new(fill));
        Ok(())
    }

    /// Makes `alias` another name for `name`'s region. Aliasing an alias points at
    /// the underlying region.
    pub fn create_const_alias(&mut self, alias: &str, name: &str) -> Result<(), ContextError> {
        let target = self.canonical(name)?.to_string();
        if self.contains(alias) {
            return Err(ContextError::DuplicateConst(alias.to_string()));
        }
        self.layout.aliases.insert(alias.to_string(), target);
        Ok(())
    }

    pub fn region(&self, name: &str) -> Result<&ConstRegion, ContextError> {
        let name = self.canonical(name)?;
        Ok(&self.layout.regions[name])
    }

    pub fn is_lazy(&self, name: &str) -> Result<bool, ContextError> {
        Ok(self.pending.contains_key(self.canonical(name)?))
    }

    fn force(&mut self, canonical: &str) -> Result<(), ContextError> {
        if let Some(reason) = self.failed.get(canonical) {
            return Err(ContextError::LazyFill {
                name: canonical.to_string(),
                reason: reason.clone(),
            });
        }
        if let Some(fill) = self.pending.remove(canonical) {
            let region = &self.layout.regions[canonical];
            let bytes = &mut self.blob[region.offset..region.offset + region.size];
            if let Err(e) = fill(bytes) {
                let reason = format!("{e:#}");
                self.failed.insert(canonical.to_string(), reason.clone());
                return Err(ContextError::LazyFill {
                    name: canonical.to_string(),
                    reason,
                });
            }
            log::trace!("Materialized lazy constant {canonical}");
        }
        Ok(())
    }

    /// Bytes of `name`. A still-lazy region yields `None` unless `force` is set, in
    /// which case it is filled first.
    pub fn get_const_data(&mut self, name: &str, force: bool) -> Result<Option<&[u8]>, ContextError> {
        let canonical = self.canonical(name)?.to_string();
        if self.failed.contains_key(&canonical) {
            self.force(&canonical)?;
        }
        if self.pending.contains_key(&canonical) {
            if !force {
                return Ok(None);
            }
            self.force(&canonical)?;
        }
        let region = &self.layout.regions[&canonical];
        Ok(Some(&self.blob[region.offset..region.offset + region.size]))
    }

    pub fn materialize_all(&mut self) -> Result<(), ContextError> {
        let mut names: Vec<String> = self.pending.keys().chain(self.failed.keys()).cloned().collect();
        names.sort();
        for name in names {
            self.force(&name)?;
        }
        Ok(())
    }

    pub fn layout(&self) -> &ConstDataLayout {
        &self.layout
    }

    pub fn region_count(&self) -> usize {
        self.layout.regions.len()
    }

    pub fn byte_len(&self) -> usize {
        self.blob.len()
    }

    /// Layout and blob for persistence. Lazy regions are materialized first.
    pub fn export(&mut self) -> Result<(ConstDataLayout, Vec<u8>), ContextError> {
        self.materialize_all()?;
        Ok((self.layout.clone(), self.blob.clone()))
    }
}
