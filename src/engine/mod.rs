//! The engine facade.
//!
//! [`Engine`] ties the layers together and exposes the operations callers
//! use, each keyed by repository. It holds no mutable state of its own:
//! everything lives in the injected blob and kv stores, so any number of
//! engines may share them.
//!
//! # Example
//!
//! ```
//! use datavcs::engine::{CommitParams, Engine};
//! use datavcs::storage::{BranchName, Entry, Key, RepositoryName};
//!
//! let engine = Engine::in_memory();
//! let repo = RepositoryName::new("example").unwrap();
//! engine.create_repository(&repo, "mem://example", &BranchName::main()).unwrap();
//!
//! let main = BranchName::main();
//! let key = Key::new("data/file.csv").unwrap();
//! engine.stage_entry(&repo, &main, &key, Entry::new("data/obj1", 10, "etag")).unwrap();
//! let commit = engine.commit(&repo, &main, CommitParams::new("add file")).unwrap();
//! assert_eq!(commit.commit.message, "add file");
//! ```

mod branch;
mod commit;
mod config;
mod dump;
mod entry;
mod gc;
mod import;
mod merge;
mod protection;
mod repository;
mod retry;

pub use commit::CommitParams;
pub use config::EngineConfig;
pub use dump::{DumpedBranch, RefsDump};
pub use entry::DeleteEntriesResult;
pub use merge::{LogParams, MergeParams};
pub use protection::{ProtectedAction, ProtectionRule};

use std::sync::Arc;

use crate::committed::{EntryIterator, MetaRangeManager, RangeManager, RecordIterator};
use crate::error::Result;
use crate::graph::{CommitGraph, CommitManager};
use crate::refs::{RefManager, Repository, ResolvedRef, Resolver};
use crate::staging::{Overlay, StagedChanges, StagingManager};
use crate::storage::{BlobStore, CommitId, KvStore, MemoryBlobStore, MemoryKv, MetaRangeId, RepositoryName, StagingToken};

/// Handle to the versioning engine; cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    store: Arc<dyn BlobStore>,
    metaranges: MetaRangeManager,
    commits: CommitManager,
    staging: StagingManager,
    refs: RefManager,
    resolver: Resolver,
}

impl Engine {
    /// Create an engine over the given stores.
    pub fn new(store: Arc<dyn BlobStore>, kv: Arc<dyn KvStore>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(store, kv, config))
    }

    /// An engine over fresh in-memory stores (for testing).
    pub fn in_memory() -> Self {
        Self::assemble(
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemoryKv::new()),
            EngineConfig::default(),
        )
    }

    fn assemble(store: Arc<dyn BlobStore>, kv: Arc<dyn KvStore>, config: EngineConfig) -> Self {
        let prefix = config.metadata_prefix.clone();
        let ranges = RangeManager::new(store.clone(), prefix.clone(), config.range);
        let metaranges = MetaRangeManager::new(store.clone(), prefix.clone(), ranges);
        let commits = CommitManager::new(store.clone(), prefix);
        let staging = StagingManager::new(kv.clone(), config.scan_batch_size);
        let refs = RefManager::new(kv, config.scan_batch_size);
        let resolver = Resolver::new(refs.clone(), commits.clone());
        Self {
            inner: Arc::new(EngineInner {
                config,
                store,
                metaranges,
                commits,
                staging,
                refs,
                resolver,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Read-only access to committed snapshots.
    pub fn metaranges(&self) -> &MetaRangeManager {
        &self.inner.metaranges
    }

    pub fn commits(&self) -> &CommitManager {
        &self.inner.commits
    }

    pub fn refs(&self) -> &RefManager {
        &self.inner.refs
    }

    pub fn staging(&self) -> &StagingManager {
        &self.inner.staging
    }

    fn prefix(&self) -> &str {
        &self.inner.config.metadata_prefix
    }

    fn repository(&self, name: &RepositoryName) -> Result<Repository> {
        self.inner.refs.get_repository(name)
    }

    fn metarange_of(&self, repository: &Repository, commit_id: &CommitId) -> Result<MetaRangeId> {
        Ok(self
            .inner
            .commits
            .get_commit(&repository.storage_namespace, commit_id)?
            .commit
            .metarange_id)
    }

    fn committed_iterator(&self, repository: &Repository, commit_id: &CommitId) -> Result<EntryIterator> {
        let metarange = self.metarange_of(repository, commit_id)?;
        self.inner.metaranges.entries(&repository.storage_namespace, &metarange)
    }

    fn staged_changes(&self, tokens: &[StagingToken]) -> Result<StagedChanges> {
        StagedChanges::new(tokens.iter().map(|t| self.inner.staging.changes(t)).collect())
    }

    /// Records visible at `resolved`: committed data, overlaid with staging
    /// when the ref is a branch.
    fn ref_iterator(&self, repository: &Repository, resolved: &ResolvedRef) -> Result<Box<dyn RecordIterator>> {
        let committed = self.committed_iterator(repository, &resolved.commit_id)?;
        if !resolved.includes_staging() {
            return Ok(Box::new(committed));
        }
        let staged = self.staged_changes(&resolved.staging_tokens)?;
        Ok(Box::new(Overlay::new(staged, committed)?))
    }

    /// true if nothing is staged in any of `tokens`
    fn staging_is_clean(&self, tokens: &[StagingToken]) -> Result<bool> {
        for token in tokens {
            if !self.inner.staging.is_empty(token)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
