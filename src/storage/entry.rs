//! Versioned entries: the values stored under every key.
//!
//! An entry points at a physical object; the engine never reads the object
//! itself, it only records where it lives and what it looks like.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::types::{content_hash, Key};

/// How `physical_address` should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AddressType {
    /// relative to the repository's storage namespace, owned by the repository
    #[default]
    Relative,
    /// a full URI, possibly outside the namespace (imported data)
    Full,
}

/// A single versioned object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub physical_address: String,
    #[serde(default)]
    pub address_type: AddressType,
    pub size: u64,
    pub checksum: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub last_modified: DateTime<Utc>,
}

/// The fields that make up an entry's identity, in a fixed order.
#[derive(Serialize)]
struct IdentityFields<'a> {
    physical_address: &'a str,
    address_type: AddressType,
    size: u64,
    checksum: &'a str,
    content_type: &'a str,
    metadata: &'a BTreeMap<String, String>,
}

impl Entry {
    pub fn new(physical_address: impl Into<String>, size: u64, checksum: impl Into<String>) -> Self {
        Self {
            physical_address: physical_address.into(),
            address_type: AddressType::Relative,
            size,
            checksum: checksum.into(),
            content_type: String::new(),
            metadata: BTreeMap::new(),
            last_modified: Utc::now(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_address_type(mut self, address_type: AddressType) -> Self {
        self.address_type = address_type;
        self
    }

    /// Digest of everything except `last_modified`.
    ///
    /// Diff and merge compare entries by identity, so restaging identical
    /// content at a later time is not a change.
    pub fn identity(&self) -> String {
        let fields = IdentityFields {
            physical_address: &self.physical_address,
            address_type: self.address_type,
            size: self.size,
            checksum: &self.checksum,
            content_type: &self.content_type,
            metadata: &self.metadata,
        };
        // serializing borrowed strings and a BTreeMap cannot fail
        let bytes = serde_json::to_vec(&fields).unwrap_or_default();
        content_hash(&bytes)
    }

    pub fn same_content(&self, other: &Entry) -> bool {
        self.identity() == other.identity()
    }
}

/// compare two optional entries by identity; `None` means absent or tombstoned
pub fn same_value(a: Option<&Entry>, b: Option<&Entry>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.same_content(b),
        _ => false,
    }
}

/// A key together with its committed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Key,
    pub entry: Entry,
}

impl Record {
    pub fn new(key: Key, entry: Entry) -> Self {
        Self { key, entry }
    }
}

/// A key with either a new value or a tombstone, as found in staging or
/// produced by a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub key: Key,
    pub value: Option<Entry>,
}

impl Change {
    pub fn set(key: Key, entry: Entry) -> Self {
        Self { key, value: Some(entry) }
    }

    pub fn delete(key: Key) -> Self {
        Self { key, value: None }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}
