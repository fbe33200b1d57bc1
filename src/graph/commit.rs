//! Commit creation and storage.
//!
//! commits are immutable and content addressed: the id is the SHA-256 of the
//! serialized commit, so writing the same commit twice is a no-op.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::storage::{write_content_addressed, BlobStore, CommitId, MetaRangeId, StorageError};

/// commit format version written by this crate
pub const COMMIT_VERSION: u32 = 1;

/// The persisted body of a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub version: u32,
    pub committer: String,
    pub message: String,
    pub metarange_id: MetaRangeId,
    pub creation_date: DateTime<Utc>,
    pub parents: Vec<CommitId>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// 1 for a root commit, otherwise one more than the highest parent
    pub generation: u64,
}

/// a commit together with its id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: CommitId,
    #[serde(flatten)]
    pub commit: Commit,
}

impl CommitRecord {
    /// check if this is a merge commit (has multiple parents)
    pub fn is_merge(&self) -> bool {
        self.commit.parents.len() > 1
    }

    /// get the first (or only) parent
    pub fn first_parent(&self) -> Option<&CommitId> {
        self.commit.parents.first()
    }

    /// get a short summary of the commit (first line of message)
    pub fn summary(&self) -> &str {
        self.commit.message.lines().next().unwrap_or(&self.commit.message)
    }
}

/// Capability for storing and reading commits.
pub trait CommitGraph: Send + Sync {
    fn get_commit(&self, namespace: &str, id: &CommitId) -> Result<CommitRecord>;

    /// store a commit and return its id
    fn add_commit(&self, namespace: &str, commit: &Commit) -> Result<CommitId>;

    /// every commit id stored in the namespace, ascending
    fn list_commits(&self, namespace: &str) -> Result<Vec<CommitId>>;
}

/// Commits stored as blobs under `{prefix}/commits/{id}`.
#[derive(Clone)]
pub struct CommitManager {
    store: Arc<dyn BlobStore>,
    prefix: String,
}

impl CommitManager {
    pub fn new(store: Arc<dyn BlobStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    fn commits_prefix(&self) -> String {
        format!("{}/commits", self.prefix)
    }

    /// Resolve an abbreviated commit id.
    ///
    /// Fails with `CommitNotFound` if nothing matches and `InvalidRef` if the
    /// prefix is ambiguous.
    pub fn find_by_prefix(&self, namespace: &str, prefix: &str) -> Result<CommitId> {
        let base = format!("{}/", self.commits_prefix());
        let keys = self.store.list(namespace, &format!("{}{}", base, prefix))?;
        match keys.as_slice() {
            [] => Err(Error::CommitNotFound(prefix.to_string())),
            [only] => Ok(CommitId::from_hex(&only[base.len()..])?),
            _ => Err(Error::InvalidRef(format!("ambiguous commit prefix: {}", prefix))),
        }
    }
}

impl CommitGraph for CommitManager {
    fn get_commit(&self, namespace: &str, id: &CommitId) -> Result<CommitRecord> {
        let key = format!("{}/{}", self.commits_prefix(), id);
        let bytes = self.store.get(namespace, &key).map_err(|e| match e {
            StorageError::BlobNotFound { .. } => Error::CommitNotFound(id.to_string()),
            other => Error::Storage(other),
        })?;
        Ok(CommitRecord {
            id: id.clone(),
            commit: serde_json::from_slice(&bytes)?,
        })
    }

    fn add_commit(&self, namespace: &str, commit: &Commit) -> Result<CommitId> {
        let bytes = serde_json::to_vec(commit)?;
        let digest = write_content_addressed(self.store.as_ref(), namespace, &self.commits_prefix(), &bytes)?;
        let id = CommitId::from_digest(digest);
        debug!(commit_id = %id, generation = commit.generation, "stored commit");
        Ok(id)
    }

    fn list_commits(&self, namespace: &str) -> Result<Vec<CommitId>> {
        let base = format!("{}/", self.commits_prefix());
        self.store
            .list(namespace, &base)?
            .iter()
            .map(|key| CommitId::from_hex(&key[base.len()..]).map_err(Error::from))
            .collect()
    }
}

/// builder for creating commits with a fluent interface
#[derive(Debug, Clone)]
pub struct CommitBuilder {
    metarange_id: Option<MetaRangeId>,
    parents: Vec<CommitId>,
    message: String,
    committer: String,
    metadata: BTreeMap<String, String>,
    creation_date: Option<DateTime<Utc>>,
}

impl Default for CommitBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitBuilder {
    pub fn new() -> Self {
        Self {
            metarange_id: None,
            parents: Vec::new(),
            message: String::new(),
            committer: String::new(),
            metadata: BTreeMap::new(),
            creation_date: None,
        }
    }

    /// set the snapshot for this commit
    pub fn metarange(mut self, id: MetaRangeId) -> Self {
        self.metarange_id = Some(id);
        self
    }

    /// add a parent commit
    pub fn parent(mut self, parent: CommitId) -> Self {
        self.parents.push(parent);
        self
    }

    /// set multiple parents (for merge commits)
    pub fn parents(mut self, parents: Vec<CommitId>) -> Self {
        self.parents = parents;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn committer(mut self, committer: impl Into<String>) -> Self {
        self.committer = committer.into();
        self
    }

    pub fn metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// override the creation date (imports, tests)
    pub fn creation_date(mut self, date: DateTime<Utc>) -> Self {
        self.creation_date = Some(date);
        self
    }

    /// Build the commit body; parents are read to compute the generation.
    pub fn build(self, graph: &dyn CommitGraph, namespace: &str) -> Result<Commit> {
        let metarange_id = self
            .metarange_id
            .ok_or_else(|| Error::InvalidValue("commit requires a metarange".to_string()))?;

        let mut generation = 0;
        for parent in &self.parents {
            generation = generation.max(graph.get_commit(namespace, parent)?.commit.generation);
        }

        Ok(Commit {
            version: COMMIT_VERSION,
            committer: self.committer,
            message: self.message,
            metarange_id,
            creation_date: self.creation_date.unwrap_or_else(Utc::now),
            parents: self.parents,
            metadata: self.metadata,
            generation: generation + 1,
        })
    }

    /// Build and store the commit.
    pub fn commit(self, graph: &dyn CommitGraph, namespace: &str) -> Result<CommitRecord> {
        let commit = self.build(graph, namespace)?;
        let id = graph.add_commit(namespace, &commit)?;
        Ok(CommitRecord { id, commit })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::{content_hash, MemoryBlobStore};

    pub(crate) const NS: &str = "mem://repo";

    pub(crate) fn graph() -> CommitManager {
        CommitManager::new(Arc::new(MemoryBlobStore::new()), "_data")
    }

    pub(crate) fn metarange(tag: &str) -> MetaRangeId {
        MetaRangeId::from_digest(content_hash(tag.as_bytes()))
    }

    /// commit with a creation date `minutes` after a fixed epoch
    pub(crate) fn commit_at(graph: &CommitManager, parents: &[&CommitId], minutes: i64, message: &str) -> CommitId {
        let epoch = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        CommitBuilder::new()
            .metarange(metarange(message))
            .parents(parents.iter().map(|p| (*p).clone()).collect())
            .message(message)
            .committer("tester")
            .creation_date(epoch + chrono::Duration::minutes(minutes))
            .commit(graph, NS)
            .unwrap()
            .id
    }

    #[test]
    fn test_generation_and_round_trip() {
        let graph = graph();
        let root = commit_at(&graph, &[], 0, "root");
        let a = commit_at(&graph, &[&root], 1, "a");
        let b = commit_at(&graph, &[&root], 2, "b");
        let merge = commit_at(&graph, &[&a, &b], 3, "merge\n\nbody");

        let record = graph.get_commit(NS, &merge).unwrap();
        assert!(record.is_merge());
        assert_eq!(record.commit.generation, 3);
        assert_eq!(record.first_parent(), Some(&a));
        assert_eq!(record.summary(), "merge");
        assert_eq!(graph.get_commit(NS, &root).unwrap().commit.generation, 1);
    }

    #[test]
    fn test_identical_commit_not_duplicated() {
        let graph = graph();
        let first = commit_at(&graph, &[], 0, "same");
        let second = commit_at(&graph, &[], 0, "same");
        assert_eq!(first, second);
        assert_eq!(graph.list_commits(NS).unwrap(), vec![first]);
    }

    #[test]
    fn test_find_by_prefix() {
        let graph = graph();
        let id = commit_at(&graph, &[], 0, "root");
        assert_eq!(graph.find_by_prefix(NS, &id.as_str()[..8]).unwrap(), id);
        assert!(graph.find_by_prefix(NS, "ffffffffff").unwrap_err().is_not_found());
    }

    #[test]
    fn test_missing_parent() {
        let graph = graph();
        let missing = CommitId::from_digest(content_hash(b"missing"));
        let err = CommitBuilder::new()
            .metarange(metarange("x"))
            .parent(missing)
            .commit(&graph, NS)
            .unwrap_err();
        assert!(matches!(err, Error::CommitNotFound(_)));
    }
}
