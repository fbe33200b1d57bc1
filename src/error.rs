//! Engine error types.
//!
//! Every public operation returns [`Result`]. Errors carry the repository,
//! ref, commit or path they concern so a caller can report them without
//! additional lookups.

use thiserror::Error;

use crate::storage::{InvalidNameError, Key, StorageError};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("branch not found: {repository}/{branch}")]
    BranchNotFound { repository: String, branch: String },

    #[error("tag not found: {repository}/{tag}")]
    TagNotFound { repository: String, tag: String },

    #[error("commit not found: {0}")]
    CommitNotFound(String),

    /// a ref expression did not resolve to anything
    #[error("ref not found: {0}")]
    RefNotFound(String),

    #[error("entry not found: {path} at {reference}")]
    EntryNotFound { reference: String, path: String },

    #[error("range not found: {0}")]
    RangeNotFound(String),

    #[error("metarange not found: {0}")]
    MetaRangeNotFound(String),

    /// the two commits share no ancestor
    #[error("no merge base between {left} and {right}")]
    NoMergeBase { left: String, right: String },

    #[error("repository already exists: {0}")]
    RepositoryExists(String),

    #[error("branch already exists: {repository}/{branch}")]
    BranchExists { repository: String, branch: String },

    #[error("tag already exists: {repository}/{tag}")]
    TagExists { repository: String, tag: String },

    /// another repository already stores data under this namespace
    #[error("storage namespace already in use: {0}")]
    NamespaceInUse(String),

    /// a merge left unresolved conflicts; nothing was committed
    #[error("merge conflict on paths: {}", paths_display(.paths))]
    ConflictFound { paths: Vec<Key> },

    /// keys handed to a writer were not strictly ascending
    #[error("ordering violation: {key} after {previous}")]
    OrderingViolation { previous: String, key: String },

    /// optimistic branch update kept losing to concurrent writers
    #[error("branch {branch} update failed after {attempts} attempts")]
    TooManyTries { branch: String, attempts: usize },

    #[error("branch {branch} has uncommitted changes")]
    DirtyBranch { branch: String },

    #[error("invalid ref: {0}")]
    InvalidRef(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    #[error("branch {branch} is protected: {action} not allowed")]
    ProtectedBranch { branch: String, action: String },

    #[error("no changes")]
    NoChanges,

    #[error("link address not found: {0}")]
    LinkAddressNotFound(String),

    #[error("link address expired: {0}")]
    LinkAddressExpired(String),

    #[error("operation cancelled")]
    Cancelled,

    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn paths_display(paths: &[Key]) -> String {
    paths.iter().map(Key::as_str).collect::<Vec<_>>().join(", ")
}

impl Error {
    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::RepositoryNotFound(_)
            | Error::BranchNotFound { .. }
            | Error::TagNotFound { .. }
            | Error::CommitNotFound(_)
            | Error::RefNotFound(_)
            | Error::EntryNotFound { .. }
            | Error::RangeNotFound(_)
            | Error::MetaRangeNotFound(_)
            | Error::NoMergeBase { .. }
            | Error::LinkAddressNotFound(_) => true,
            Error::Storage(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// check if this error is a conflict
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::RepositoryExists(_)
                | Error::BranchExists { .. }
                | Error::TagExists { .. }
                | Error::NamespaceInUse(_)
                | Error::ConflictFound { .. }
        )
    }

    /// check if the operation may succeed when retried as is
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::TooManyTries { .. } => true,
            Error::Storage(e) => e.is_retriable(),
            _ => false,
        }
    }
}
