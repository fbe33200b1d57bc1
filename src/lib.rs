//! datavcs - Git-like versioning for data in object stores
//!
//! Objects stay where they are; the engine versions the mapping from
//! logical keys to physical addresses. Branches are cheap, commits share
//! every unchanged range with their parents, and merges work on whole
//! snapshots at once.
//!
//! # Layers
//!
//! ```text
//!  engine     repositories, branches, commits, merges, GC entry points
//!  refs       branch / tag records and ref expressions
//!  staging    uncommitted writes, overlaid on committed data
//!  graph      commits, history walks, merge bases
//!  merge      diff and three-way merge over sorted record streams
//!  committed  immutable ranges and metaranges
//!  storage    blob store + versioned kv store
//! ```
//!
//! # Example
//!
//! ```
//! use datavcs::engine::{CommitParams, Engine};
//! use datavcs::storage::{BranchName, Entry, Key, RepositoryName};
//!
//! let engine = Engine::in_memory();
//! let repo = RepositoryName::new("lake").unwrap();
//! let main = BranchName::main();
//! engine.create_repository(&repo, "mem://lake", &main).unwrap();
//!
//! let key = Key::new("tables/events/part-0.parquet").unwrap();
//! engine.stage_entry(&repo, &main, &key, Entry::new("data/part-0", 1024, "etag")).unwrap();
//! engine.commit(&repo, &main, CommitParams::new("add events")).unwrap();
//! ```

pub mod cancel;
pub mod committed;
pub mod engine;
pub mod error;
pub mod gc;
pub mod graph;
pub mod merge;
pub mod refs;
pub mod staging;
pub mod storage;

pub use cancel::CancelFlag;
pub use engine::{Engine, EngineConfig};
pub use error::{Error, Result};
