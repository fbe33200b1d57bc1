//!  Blob capability: immutable objects addressed by (namespace, key).
//!
//! Ranges, metaranges, commits and GC reports are all blobs. Writes are
//! whole-object and atomic: a reader sees either nothing or the complete
//! blob, never a prefix of it. Most blobs are content addressed through
//! [`write_content_addressed`], which makes rewriting identical data a no-op.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::ops::Bound;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::content_hash;

/// The object store capability the engine persists into.
pub trait BlobStore: Send + Sync {
    /// write a whole blob, replacing any previous content atomically
    fn put(&self, namespace: &str, key: &str, bytes: &[u8]) -> StorageResult<()>;

    /// read a whole blob
    fn get(&self, namespace: &str, key: &str) -> StorageResult<Vec<u8>>;

    fn exists(&self, namespace: &str, key: &str) -> StorageResult<bool>;

    /// list keys under `prefix`, sorted ascending
    fn list(&self, namespace: &str, prefix: &str) -> StorageResult<Vec<String>>;
}

/// Write `bytes` under `{prefix}/{sha256(bytes)}` unless already present.
///
/// Returns the hex digest.
pub fn write_content_addressed(
    store: &dyn BlobStore,
    namespace: &str,
    prefix: &str,
    bytes: &[u8],
) -> StorageResult<String> {
    let digest = content_hash(bytes);
    let key = format!("{}/{}", prefix, digest);
    if store.exists(namespace, &key)? {
        debug!(namespace, key = %key, "content already stored");
        return Ok(digest);
    }
    store.put(namespace, &key, bytes)?;
    Ok(digest)
}

/// In-memory blob store, shared by cloning.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<BTreeMap<String, BTreeMap<String, Arc<Vec<u8>>>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// number of blobs stored in a namespace
    pub fn count(&self, namespace: &str) -> usize {
        self.blobs.read().get(namespace).map_or(0, BTreeMap::len)
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, namespace: &str, key: &str, bytes: &[u8]) -> StorageResult<()> {
        let mut blobs = self.blobs.write();
        blobs
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), Arc::new(bytes.to_vec()));
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> StorageResult<Vec<u8>> {
        let blobs = self.blobs.read();
        blobs
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .map(|bytes| bytes.as_ref().clone())
            .ok_or_else(|| StorageError::BlobNotFound {
                namespace: namespace.to_string(),
                key: key.to_string(),
            })
    }

    fn exists(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        Ok(self
            .blobs
            .read()
            .get(namespace)
            .is_some_and(|ns| ns.contains_key(key)))
    }

    fn list(&self, namespace: &str, prefix: &str) -> StorageResult<Vec<String>> {
        let blobs = self.blobs.read();
        let Some(ns) = blobs.get(namespace) else {
            return Ok(Vec::new());
        };
        Ok(ns
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

/// Blob store on the local filesystem.
///
/// A namespace such as `local://bucket/repo` maps to `{root}/bucket/repo`.
/// Blobs are written to a temporary file in the target directory and renamed
/// into place.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| StorageError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> StorageResult<PathBuf> {
        let relative = namespace.split_once("://").map_or(namespace, |(_, rest)| rest);
        let relative = Path::new(relative.trim_start_matches('/'));
        Self::check_relative(relative, namespace)?;
        Ok(self.root.join(relative))
    }

    fn blob_path(&self, namespace: &str, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(key);
        Self::check_relative(relative, key)?;
        Ok(self.namespace_dir(namespace)?.join(relative))
    }

    fn check_relative(path: &Path, original: &str) -> StorageResult<()> {
        let escapes = path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(StorageError::CorruptedData {
                key: original.to_string(),
                reason: "path escapes the store root".to_string(),
            });
        }
        Ok(())
    }

    fn collect(dir: &Path, base: &Path, out: &mut Vec<String>) -> StorageResult<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::io(dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(dir, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| StorageError::io(&path, e))?;
            if file_type.is_dir() {
                Self::collect(&path, base, out)?;
            } else if let Ok(relative) = path.strip_prefix(base) {
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(key);
            }
        }
        Ok(())
    }
}

impl BlobStore for LocalBlobStore {
    fn put(&self, namespace: &str, key: &str, bytes: &[u8]) -> StorageResult<()> {
        let path = self.blob_path(namespace, key)?;
        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent).map_err(|e| StorageError::io(&parent, e))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&parent).map_err(|e| StorageError::io(&parent, e))?;
        tmp.write_all(bytes).map_err(|e| StorageError::io(tmp.path(), e))?;
        tmp.as_file().sync_all().map_err(|e| StorageError::io(tmp.path(), e))?;
        tmp.persist(&path).map_err(|e| StorageError::io(&path, e.error))?;
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.blob_path(namespace, key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::BlobNotFound {
                namespace: namespace.to_string(),
                key: key.to_string(),
            }),
            Err(e) => Err(StorageError::io(path, e)),
        }
    }

    fn exists(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        Ok(self.blob_path(namespace, key)?.is_file())
    }

    fn list(&self, namespace: &str, prefix: &str) -> StorageResult<Vec<String>> {
        let base = self.namespace_dir(namespace)?;
        let mut keys = Vec::new();
        Self::collect(&base, &base, &mut keys)?;
        // skip temporaries that are mid-rename
        keys.retain(|k| k.starts_with(prefix) && !k.rsplit('/').next().is_some_and(|n| n.starts_with(".tmp")));
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(store: &dyn BlobStore) {
        store.put("ns", "a/1", b"one").unwrap();
        store.put("ns", "a/2", b"two").unwrap();
        store.put("ns", "b/1", b"three").unwrap();
        store.put("other", "a/9", b"x").unwrap();

        assert_eq!(store.get("ns", "a/2").unwrap(), b"two");
        assert!(store.exists("ns", "b/1").unwrap());
        assert!(!store.exists("ns", "b/2").unwrap());
        assert_eq!(store.list("ns", "a/").unwrap(), vec!["a/1", "a/2"]);

        let err = store.get("ns", "missing").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryBlobStore::new();
        exercise(&store);
        assert_eq!(store.count("ns"), 3);
    }

    #[test]
    fn test_local_store() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::open(dir.path()).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_local_store_namespace_scheme() {
        let dir = TempDir::new().unwrap();
        let store = LocalBlobStore::open(dir.path()).unwrap();
        store.put("local://bucket/repo", "k", b"v").unwrap();
        assert!(dir.path().join("bucket/repo/k").is_file());
        assert!(store.put("ns", "../escape", b"v").is_err());
    }

    #[test]
    fn test_content_addressed_dedup() {
        let store = MemoryBlobStore::new();
        let a = write_content_addressed(&store, "ns", "ranges", b"payload").unwrap();
        let b = write_content_addressed(&store, "ns", "ranges", b"payload").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.count("ns"), 1);
    }
}
