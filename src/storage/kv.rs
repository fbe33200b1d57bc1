//! Versioned key-value capability for the small amount of mutable state:
//! repository records, branches, tags, staging areas and GC bookkeeping.
//!
//! Every value carries an opaque [`Predicate`]; conditional writes succeed only
//! if the predicate still matches, which is how branch updates get
//! compare-and-swap semantics without holding a lock across I/O.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::storage::error::{StorageError, StorageResult};

/// Opaque version token of a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Predicate(u64);

/// a value together with the predicate to update it conditionally
#[derive(Debug, Clone)]
pub struct ValueWithPredicate {
    pub value: Vec<u8>,
    pub predicate: Predicate,
}

pub trait KvStore: Send + Sync {
    fn get(&self, partition: &str, key: &str) -> StorageResult<Option<ValueWithPredicate>>;

    /// unconditional upsert
    fn set(&self, partition: &str, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Conditional write.
    ///
    /// With `None` the key must not exist ([`StorageError::AlreadyExists`]);
    /// with `Some(p)` the stored predicate must equal `p`
    /// ([`StorageError::PredicateFailed`]).
    fn set_if(&self, partition: &str, key: &str, value: &[u8], predicate: Option<Predicate>) -> StorageResult<()>;

    /// delete a key; deleting a missing key is not an error
    fn delete(&self, partition: &str, key: &str) -> StorageResult<()>;

    /// up to `limit` entries with `key >= start`, ascending
    fn scan(&self, partition: &str, start: &str, limit: usize) -> StorageResult<Vec<(String, Vec<u8>)>>;

    fn delete_partition(&self, partition: &str) -> StorageResult<()>;
}

/// In-memory kv store, shared by cloning.
#[derive(Clone, Default)]
pub struct MemoryKv {
    inner: Arc<MemoryKvInner>,
}

#[derive(Default)]
struct MemoryKvInner {
    partitions: RwLock<BTreeMap<String, BTreeMap<String, (Vec<u8>, u64)>>>,
    version: AtomicU64,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> u64 {
        self.inner.version.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl KvStore for MemoryKv {
    fn get(&self, partition: &str, key: &str) -> StorageResult<Option<ValueWithPredicate>> {
        let partitions = self.inner.partitions.read();
        Ok(partitions
            .get(partition)
            .and_then(|p| p.get(key))
            .map(|(value, version)| ValueWithPredicate {
                value: value.clone(),
                predicate: Predicate(*version),
            }))
    }

    fn set(&self, partition: &str, key: &str, value: &[u8]) -> StorageResult<()> {
        let version = self.next_version();
        let mut partitions = self.inner.partitions.write();
        partitions
            .entry(partition.to_string())
            .or_default()
            .insert(key.to_string(), (value.to_vec(), version));
        Ok(())
    }

    fn set_if(&self, partition: &str, key: &str, value: &[u8], predicate: Option<Predicate>) -> StorageResult<()> {
        let version = self.next_version();
        let mut partitions = self.inner.partitions.write();
        let records = partitions.entry(partition.to_string()).or_default();
        let current = records.get(key).map(|(_, v)| Predicate(*v));
        match (predicate, current) {
            (None, None) => {}
            (None, Some(_)) => {
                return Err(StorageError::AlreadyExists {
                    partition: partition.to_string(),
                    key: key.to_string(),
                })
            }
            (Some(expected), Some(found)) if expected == found => {}
            (Some(_), _) => {
                return Err(StorageError::PredicateFailed {
                    partition: partition.to_string(),
                    key: key.to_string(),
                })
            }
        }
        records.insert(key.to_string(), (value.to_vec(), version));
        Ok(())
    }

    fn delete(&self, partition: &str, key: &str) -> StorageResult<()> {
        let mut partitions = self.inner.partitions.write();
        if let Some(records) = partitions.get_mut(partition) {
            records.remove(key);
        }
        Ok(())
    }

    fn scan(&self, partition: &str, start: &str, limit: usize) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let partitions = self.inner.partitions.read();
        let Some(records) = partitions.get(partition) else {
            return Ok(Vec::new());
        };
        Ok(records
            .range::<str, _>((Bound::Included(start), Bound::Unbounded))
            .take(limit)
            .map(|(k, (v, _))| (k.clone(), v.clone()))
            .collect())
    }

    fn delete_partition(&self, partition: &str) -> StorageResult<()> {
        self.inner.partitions.write().remove(partition);
        Ok(())
    }
}

/// smallest key strictly greater than `key`
pub(crate) fn key_after(key: &str) -> String {
    format!("{}\u{0}", key)
}

/// read and decode a JSON value
pub(crate) fn get_json<T: DeserializeOwned>(
    kv: &dyn KvStore,
    partition: &str,
    key: &str,
) -> StorageResult<Option<(T, Predicate)>> {
    match kv.get(partition, key)? {
        Some(found) => {
            let value = serde_json::from_slice(&found.value)?;
            Ok(Some((value, found.predicate)))
        }
        None => Ok(None),
    }
}

pub(crate) fn set_json<T: Serialize>(kv: &dyn KvStore, partition: &str, key: &str, value: &T) -> StorageResult<()> {
    let bytes = serde_json::to_vec(value)?;
    kv.set(partition, key, &bytes)
}

pub(crate) fn set_json_if<T: Serialize>(
    kv: &dyn KvStore,
    partition: &str,
    key: &str,
    value: &T,
    predicate: Option<Predicate>,
) -> StorageResult<()> {
    let bytes = serde_json::to_vec(value)?;
    kv.set_if(partition, key, &bytes, predicate)
}

/// Every decoded value under `prefix` with key strictly after `after`, in pages.
pub(crate) fn scan_json<T: DeserializeOwned>(
    kv: &dyn KvStore,
    partition: &str,
    prefix: &str,
    after: Option<&str>,
    page_size: usize,
) -> StorageResult<Vec<(String, T)>> {
    let mut start = match after {
        Some(after) if after >= prefix => key_after(after),
        _ => prefix.to_string(),
    };
    let mut out = Vec::new();
    loop {
        let page = kv.scan(partition, &start, page_size.max(1))?;
        let full = page.len() >= page_size.max(1);
        let mut last = None;
        for (key, bytes) in page {
            if !key.starts_with(prefix) {
                return Ok(out);
            }
            out.push((key.clone(), serde_json::from_slice(&bytes)?));
            last = Some(key);
        }
        match last {
            Some(last) if full => start = key_after(&last),
            _ => return Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_if_create_only() {
        let kv = MemoryKv::new();
        kv.set_if("p", "k", b"1", None).unwrap();
        let err = kv.set_if("p", "k", b"2", None).unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
    }

    #[test]
    fn test_compare_and_swap() {
        let kv = MemoryKv::new();
        kv.set("p", "k", b"1").unwrap();
        let first = kv.get("p", "k").unwrap().unwrap();

        kv.set_if("p", "k", b"2", Some(first.predicate)).unwrap();

        // stale predicate loses
        let err = kv.set_if("p", "k", b"3", Some(first.predicate)).unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(kv.get("p", "k").unwrap().unwrap().value, b"2");
    }

    #[test]
    fn test_scan_json_pages() {
        let kv = MemoryKv::new();
        for i in 0..7 {
            set_json(&kv, "p", &format!("b/{}", i), &i).unwrap();
        }
        set_json(&kv, "p", "a", &100).unwrap();
        set_json(&kv, "p", "c", &200).unwrap();

        let all: Vec<(String, i32)> = scan_json(&kv, "p", "b/", None, 3).unwrap();
        assert_eq!(all.len(), 7);
        assert_eq!(all[0].1, 0);

        let after: Vec<(String, i32)> = scan_json(&kv, "p", "b/", Some("b/4"), 3).unwrap();
        assert_eq!(after.iter().map(|(_, v)| *v).collect::<Vec<_>>(), vec![5, 6]);
    }

    #[test]
    fn test_delete_partition() {
        let kv = MemoryKv::new();
        kv.set("p", "k", b"1").unwrap();
        kv.delete_partition("p").unwrap();
        assert!(kv.get("p", "k").unwrap().is_none());
        assert!(kv.scan("p", "", 10).unwrap().is_empty());
    }
}
