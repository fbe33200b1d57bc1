//! storage layer for datavcs
//!
//! this module provides the two capabilities everything else is built on:
//! an immutable blob store for content-addressed data and a small versioned
//! kv store for the mutable state. The upper layers never assume anything
//! about the backing implementation beyond these traits.
//!
//!  # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                              │
//! │   (repositories, branches, commits, merges, GC)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┴─────────────────────┐
//!        │                                           │
//!        ▼                                           ▼
//!  ┌─────────────┐                             ┌─────────────┐
//!  │  BlobStore  │                             │   KvStore   │
//!  │ (ranges,    │                             │ (branches,  │
//!  │  commits)   │                             │  staging)   │
//!  └─────────────┘                             └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use datavcs::storage::{BlobStore, MemoryBlobStore, write_content_addressed};
//!
//! let store = MemoryBlobStore::new();
//! let id = write_content_addressed(&store, "mem://repo", "_data/ranges", b"payload").unwrap();
//! assert!(store.exists("mem://repo", &format!("_data/ranges/{}", id)).unwrap());
//! ```

mod blob;
mod entry;
mod error;
mod kv;
mod types;

pub use blob::{write_content_addressed, BlobStore, LocalBlobStore, MemoryBlobStore};
pub use entry::{same_value, AddressType, Change, Entry, Record};
pub use error::{StorageError, StorageResult};
pub use kv::{KvStore, MemoryKv, Predicate, ValueWithPredicate};
pub use types::{
    BranchName, CommitId, InvalidNameError, Key, MetaRangeId, RangeId, RepositoryName, StagingToken,
    TagName,
};

pub(crate) use kv::{get_json, scan_json, set_json, set_json_if};
pub(crate) use types::{content_hash, HASH_HEX_LEN};
