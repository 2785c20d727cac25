//! Where cached files live: a directory per key, or one archive file.
use crate::cache::CacheError;
use ciborium::Value;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub trait CacheStorage {
    /// Contents of `name`, or `None` if it was never written.
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, CacheError>;

    fn write(&mut self, name: &str, data: &[u8]) -> Result<(), CacheError>;

    /// Makes every write since the last commit durable.
    fn commit(&mut self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl CacheStorage for DirectoryStorage {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match std::fs::read(self.root.join(name)) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&mut self, name: &str, data: &[u8]) -> Result<(), CacheError> {
        std::fs::create_dir_all(&self.root)?;
        let path = self.root.join(name);
        let partial = self.root.join(format!("{name}.partial"));
        std::fs::write(&partial, data)?;
        std::fs::rename(&partial, &path)?;
        Ok(())
    }
}

/// Cached files in a single CBOR map, gzip-compressed on request. Reading detects
/// compression from the file's magic bytes.
///
/// Several cache keys can share one archive; a scoped archive prefixes every name
/// with its key.
#[derive(Debug, Clone)]
pub struct ArchiveStorage {
    path: Option<PathBuf>,
    compress: bool,
    scope: Option<String>,
    entries: BTreeMap<String, Vec<u8>>,
}

impl ArchiveStorage {
    pub fn in_memory(compress: bool) -> Self {
        Self {
            path: None,
            compress,
            scope: None,
            entries: BTreeMap::new(),
        }
    }

    /// Opens `path`, starting empty if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>, compress: bool) -> Result<Self, CacheError> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => Self::decode(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path: Some(path),
            compress,
            scope: None,
            entries,
        })
    }

    pub fn from_bytes(bytes: &[u8], compress: bool) -> Result<Self, CacheError> {
        Ok(Self {
            path: None,
            compress,
            scope: None,
            entries: Self::decode(bytes)?,
        })
    }

    /// Commits go to `path`, replacing whatever is there.
    pub fn persisted_at(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn scoped(mut self, scope: &str) -> Self {
        self.scope = Some(scope.to_string());
        self
    }

    fn entry_name(&self, name: &str) -> String {
        match &self.scope {
            Some(scope) => format!("{scope}/{name}"),
            None => name.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn decode(bytes: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, CacheError> {
        let mut raw = Vec::new();
        let bytes = if bytes.starts_with(&GZIP_MAGIC) {
            GzDecoder::new(bytes).read_to_end(&mut raw)?;
            raw.as_slice()
        } else {
            bytes
        };
        let value: Value = ciborium::from_reader(bytes).map_err(|e| CacheError::Archive(e.to_string()))?;
        let Value::Map(pairs) = value else {
            return Err(CacheError::Archive("archive root is not a map".to_string()));
        };
        let mut entries = BTreeMap::new();
        for (key, value) in pairs {
            match (key, value) {
                (Value::Text(name), Value::Bytes(data)) => {
                    entries.insert(name, data);
                }
                _ => return Err(CacheError::Archive("archive entries must map names to bytes".to_string())),
            }
        }
        Ok(entries)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CacheError> {
        let value = Value::Map(
            self.entries
                .iter()
                .map(|(k, v)| (Value::Text(k.clone()), Value::Bytes(v.clone())))
                .collect(),
        );
        let mut out = Vec::new();
        ciborium::into_writer(&value, &mut out).map_err(|e| CacheError::Archive(e.to_string()))?;
        if !self.compress {
            return Ok(out);
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&out)?;
        Ok(encoder.finish()?)
    }
}

impl CacheStorage for ArchiveStorage {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.entries.get(&self.entry_name(name)).cloned())
    }

    fn write(&mut self, name: &str, data: &[u8]) -> Result<(), CacheError> {
        self.entries.insert(self.entry_name(name), data.to_vec());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), CacheError> {
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, self.to_bytes()?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_detects_compression() {
        for compress in [false, true] {
            let mut archive = ArchiveStorage::in_memory(compress);
            archive.write("context.json", b"{}").unwrap();
            archive.write("const.bin", &[1, 2, 3]).unwrap();
            let bytes = archive.to_bytes().unwrap();
            assert_eq!(bytes.starts_with(&GZIP_MAGIC), compress);
            // Compression on write is independent of how the archive was read.
            let reopened = ArchiveStorage::from_bytes(&bytes, !compress).unwrap();
            assert_eq!(reopened.read("const.bin").unwrap(), Some(vec![1, 2, 3]));
            assert_eq!(reopened.read("missing").unwrap(), None);
        }
    }

    #[test]
    fn scopes_do_not_collide() {
        let mut first = ArchiveStorage::in_memory(false).scoped("a");
        first.write("const.bin", &[1]).unwrap();
        let bytes = first.to_bytes().unwrap();
        let mut second = ArchiveStorage::from_bytes(&bytes, false).unwrap().scoped("b");
        assert_eq!(second.read("const.bin").unwrap(), None);
        second.write("const.bin", &[2]).unwrap();
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn garbage_is_not_an_archive() {
        assert!(ArchiveStorage::from_bytes(b"definitely not cbor", false).is_err());
    }
}
