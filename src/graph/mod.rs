//! The commit graph: immutable commits, history walks and merge bases.

mod commit;
mod log;
mod merge_base;

pub use commit::{Commit, CommitBuilder, CommitGraph, CommitManager, CommitRecord, COMMIT_VERSION};
pub use log::{CommitFilter, CommitLog, LogOptions};
pub use merge_base::{find_merge_base, is_ancestor};

#[cfg(test)]
pub(crate) use commit::tests as test_support;
