//! Ranges: immutable, sorted, content-addressed batches of records.
//!
//! A range is stored as two blobs under the repository namespace:
//! `{prefix}/ranges/{id}` holds the records and `{prefix}/range_info/{id}`
//! holds the bounds, so a metarange can be validated or planned without
//! reading any records.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::storage::{content_hash, BlobStore, Key, RangeId, Record, StorageError};

/// Target size of the ranges produced by writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangeConfig {
    /// flush once this many records are buffered
    pub target_entries: usize,
    /// flush once the estimated encoded size reaches this many bytes
    pub target_bytes: u64,
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            target_entries: 10_000,
            target_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Where a range lives in the key space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    pub id: RangeId,
    pub min_key: Key,
    pub max_key: Key,
    pub count: u64,
    pub estimated_size: u64,
}

impl RangeDescriptor {
    /// true if `key` falls inside `[min_key, max_key]`
    pub fn contains(&self, key: &str) -> bool {
        self.min_key.as_str() <= key && key <= self.max_key.as_str()
    }
}

#[derive(Serialize, Deserialize)]
struct RangeInfo {
    min_key: Key,
    max_key: Key,
    count: u64,
    estimated_size: u64,
}

/// rough encoded size of a record, used only for splitting decisions
pub(crate) fn estimated_size(record: &Record) -> u64 {
    let entry = &record.entry;
    let metadata: usize = entry.metadata.iter().map(|(k, v)| k.len() + v.len()).sum();
    (record.key.as_str().len()
        + entry.physical_address.len()
        + entry.checksum.len()
        + entry.content_type.len()
        + metadata
        + 64) as u64
}

/// Reads and writes ranges in a blob store.
#[derive(Clone)]
pub struct RangeManager {
    store: Arc<dyn BlobStore>,
    prefix: String,
    config: RangeConfig,
}

impl RangeManager {
    pub fn new(store: Arc<dyn BlobStore>, prefix: impl Into<String>, config: RangeConfig) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            config,
        }
    }

    pub fn config(&self) -> &RangeConfig {
        &self.config
    }

    pub(crate) fn range_key(&self, id: &RangeId) -> String {
        format!("{}/ranges/{}", self.prefix, id)
    }

    fn info_key(&self, id: &RangeId) -> String {
        format!("{}/range_info/{}", self.prefix, id)
    }

    /// Start a writer that splits its input at the configured target size.
    pub fn writer(&self, namespace: &str) -> RangeWriter {
        RangeWriter {
            manager: self.clone(),
            namespace: namespace.to_string(),
            buffer: Vec::new(),
            buffered_bytes: 0,
            last_key: None,
        }
    }

    /// Write strictly ascending records as one or more ranges.
    pub fn write_range(
        &self,
        namespace: &str,
        records: impl IntoIterator<Item = Record>,
    ) -> Result<Vec<RangeDescriptor>> {
        let mut writer = self.writer(namespace);
        let mut descriptors = Vec::new();
        for record in records {
            descriptors.extend(writer.add(record)?);
        }
        descriptors.extend(writer.flush()?);
        Ok(descriptors)
    }

    /// Persist one range exactly as given; the caller guarantees ordering.
    fn persist(&self, namespace: &str, records: &[Record]) -> Result<RangeDescriptor> {
        let (first, last) = match (records.first(), records.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(Error::InvalidValue("cannot write an empty range".to_string())),
        };
        let bytes = serde_json::to_vec(records)?;
        let id = RangeId::from_digest(content_hash(&bytes));
        let key = self.range_key(&id);

        let descriptor = RangeDescriptor {
            id: id.clone(),
            min_key: first.key.clone(),
            max_key: last.key.clone(),
            count: records.len() as u64,
            estimated_size: records.iter().map(estimated_size).sum(),
        };

        if self.store.exists(namespace, &key)? {
            debug!(range_id = %id, "range already stored");
            return Ok(descriptor);
        }

        let info = RangeInfo {
            min_key: descriptor.min_key.clone(),
            max_key: descriptor.max_key.clone(),
            count: descriptor.count,
            estimated_size: descriptor.estimated_size,
        };
        // header first: a visible range always has its bounds available
        self.store.put(namespace, &self.info_key(&id), &serde_json::to_vec(&info)?)?;
        self.store.put(namespace, &key, &bytes)?;
        debug!(range_id = %id, count = descriptor.count, "wrote range");
        Ok(descriptor)
    }

    /// Read every record of a range, in key order.
    ///
    /// Each call re-reads the blob, so the returned iterator can be
    /// restarted by calling this again.
    pub fn read_range(&self, namespace: &str, id: &RangeId) -> Result<std::vec::IntoIter<Record>> {
        let bytes = self.get(namespace, &self.range_key(id), id)?;
        let records: Vec<Record> = serde_json::from_slice(&bytes)?;
        Ok(records.into_iter())
    }

    /// Bounds and count of a range, from its header alone.
    pub fn range_bounds(&self, namespace: &str, id: &RangeId) -> Result<RangeDescriptor> {
        let bytes = self.get(namespace, &self.info_key(id), id)?;
        let info: RangeInfo = serde_json::from_slice(&bytes)?;
        Ok(RangeDescriptor {
            id: id.clone(),
            min_key: info.min_key,
            max_key: info.max_key,
            count: info.count,
            estimated_size: info.estimated_size,
        })
    }

    fn get(&self, namespace: &str, key: &str, id: &RangeId) -> Result<Vec<u8>> {
        self.store.get(namespace, key).map_err(|e| match e {
            StorageError::BlobNotFound { .. } => Error::RangeNotFound(id.to_string()),
            other => Error::Storage(other),
        })
    }
}

/// Buffers ascending records and cuts them into ranges.
pub struct RangeWriter {
    manager: RangeManager,
    namespace: String,
    buffer: Vec<Record>,
    buffered_bytes: u64,
    last_key: Option<Key>,
}

impl RangeWriter {
    /// Add the next record; returns a descriptor when a range was cut.
    pub fn add(&mut self, record: Record) -> Result<Option<RangeDescriptor>> {
        if let Some(previous) = &self.last_key {
            if record.key <= *previous {
                return Err(Error::OrderingViolation {
                    previous: previous.to_string(),
                    key: record.key.to_string(),
                });
            }
        }
        self.last_key = Some(record.key.clone());
        self.buffered_bytes += estimated_size(&record);
        self.buffer.push(record);

        let config = self.manager.config;
        if self.buffer.len() >= config.target_entries.max(1) || self.buffered_bytes >= config.target_bytes {
            return self.flush();
        }
        Ok(None)
    }

    /// Write whatever is buffered as a range.
    pub fn flush(&mut self) -> Result<Option<RangeDescriptor>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let descriptor = self.manager.persist(&self.namespace, &self.buffer)?;
        self.buffer.clear();
        self.buffered_bytes = 0;
        Ok(Some(descriptor))
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
