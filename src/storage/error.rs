//! Storage layer error types
//!
//! Errors raised by the blob and kv capabilities. Higher layers wrap these
//! in [`crate::Error`].

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::types::InvalidNameError;

/// the main error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// the requested blob does not exist
    #[error("blob not found: {namespace}/{key}")]
    BlobNotFound { namespace: String, key: String },

    /// a conditional kv write lost against a concurrent update
    #[error("predicate failed: {partition}/{key}")]
    PredicateFailed { partition: String, key: String },

    /// a conditional kv create found an existing value
    #[error("key already exists: {partition}/{key}")]
    AlreadyExists { partition: String, key: String },

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// data integrity check failed
    #[error("corrupted data at {key}: {reason}")]
    CorruptedData { key: String, reason: String },

    /// invalid blob key or namespace
    #[error("invalid name: {0}")]
    InvalidName(#[from] InvalidNameError),

    /// I/O error (filesystem level)
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// check if this error indicates the resource doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::BlobNotFound { .. })
    }

    /// check if this error is recoverable by retry
    pub fn is_retriable(&self) -> bool {
        matches!(self, StorageError::PredicateFailed { .. })
    }
}

/// result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
