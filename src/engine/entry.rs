//! Entry reads and staging writes.

use chrono::Utc;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::committed::{list_records, ListOptions, Listing, RangeDescriptor};
use crate::engine::protection::ProtectedAction;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::refs::{LinkAddress, Repository};
use crate::storage::{BranchName, Entry, Key, MetaRangeId, RangeId, Record, RepositoryName, StagingToken};

/// Outcome of a batch delete: every path either succeeded or failed.
#[derive(Debug, Default)]
pub struct DeleteEntriesResult {
    pub deleted: Vec<Key>,
    pub failed: Vec<(Key, Error)>,
}

impl Engine {
    /// Read `path` as seen at `reference`.
    ///
    /// On a branch the current staging token wins over sealed tokens, which
    /// win over the committed snapshot. A staged tombstone hides the path.
    pub fn get_entry(&self, repository: &RepositoryName, reference: &str, path: &str) -> Result<Entry> {
        let repo = self.repository(repository)?;
        let resolved = self.inner.resolver.resolve(&repo, reference)?;
        let not_found = || Error::EntryNotFound {
            reference: reference.to_string(),
            path: path.to_string(),
        };

        for token in &resolved.staging_tokens {
            if let Some(staged) = self.inner.staging.get(token, path)? {
                return staged.ok_or_else(not_found);
            }
        }
        let metarange = self.metarange_of(&repo, &resolved.commit_id)?;
        self.inner
            .metaranges
            .get_entry(&repo.storage_namespace, &metarange, path)?
            .map(|record| record.entry)
            .ok_or_else(not_found)
    }

    /// List entries at `reference`, staged changes included on branches.
    pub fn list_entries(
        &self,
        repository: &RepositoryName,
        reference: &str,
        options: &ListOptions,
    ) -> Result<Vec<Listing>> {
        let repo = self.repository(repository)?;
        let resolved = self.inner.resolver.resolve(&repo, reference)?;
        let mut iter = self.ref_iterator(&repo, &resolved)?;
        list_records(&mut iter, options)
    }

    /// Stage `entry` at `path` on the branch.
    pub fn stage_entry(&self, repository: &RepositoryName, branch: &BranchName, path: &Key, entry: Entry) -> Result<()> {
        self.repository(repository)?;
        self.check_protection(repository, branch, ProtectedAction::StagingWrite)?;
        self.write_staging(repository, branch, |token| self.inner.staging.set(token, path, Some(&entry)))?;
        debug!(repository = %repository, branch = %branch, path = %path, "staged entry");
        Ok(())
    }

    /// Stage a tombstone for `path`; fails if the path is not visible.
    pub fn delete_entry(&self, repository: &RepositoryName, branch: &BranchName, path: &Key) -> Result<()> {
        self.repository(repository)?;
        self.check_protection(repository, branch, ProtectedAction::StagingWrite)?;
        self.stage_tombstone(repository, branch, path)
    }

    fn stage_tombstone(&self, repository: &RepositoryName, branch: &BranchName, path: &Key) -> Result<()> {
        self.get_entry(repository, branch.as_str(), path.as_str())?;
        self.write_staging(repository, branch, |token| self.inner.staging.set(token, path, None))?;
        debug!(repository = %repository, branch = %branch, path = %path, "staged tombstone");
        Ok(())
    }

    /// Delete many paths; a failing path does not stop the others.
    pub fn delete_entries(
        &self,
        repository: &RepositoryName,
        branch: &BranchName,
        paths: &[Key],
    ) -> Result<DeleteEntriesResult> {
        self.repository(repository)?;
        self.check_protection(repository, branch, ProtectedAction::StagingWrite)?;
        let mut result = DeleteEntriesResult::default();
        for path in paths {
            match self.stage_tombstone(repository, branch, path) {
                Ok(()) => result.deleted.push(path.clone()),
                Err(e) => {
                    warn!(repository = %repository, branch = %branch, path = %path, error = %e, "failed to delete entry");
                    result.failed.push((path.clone(), e));
                }
            }
        }
        Ok(result)
    }

    /// Drop whatever is staged for `path` on the branch.
    pub fn reset_entry(&self, repository: &RepositoryName, branch: &BranchName, path: &Key) -> Result<()> {
        self.repository(repository)?;
        self.check_protection(repository, branch, ProtectedAction::StagingWrite)?;
        self.write_staging(repository, branch, |token| self.inner.staging.drop_key(token, path.as_str()))
    }

    /// Drop every staged path under `prefix`; returns how many were dropped.
    pub fn reset_prefix(&self, repository: &RepositoryName, branch: &BranchName, prefix: &str) -> Result<usize> {
        self.repository(repository)?;
        self.check_protection(repository, branch, ProtectedAction::StagingWrite)?;
        self.write_staging(repository, branch, |token| self.inner.staging.drop_prefix(token, prefix))
    }

    /// Apply `write` to the branch's current staging token.
    ///
    /// A commit may seal the token between the read and the write, after
    /// which the write is not guaranteed to reach the commit. The branch is
    /// read again afterwards and the write repeated on the new token until
    /// the token holds still.
    fn write_staging<T>(
        &self,
        repository: &RepositoryName,
        branch: &BranchName,
        mut write: impl FnMut(&StagingToken) -> Result<T>,
    ) -> Result<T> {
        let tries = self.inner.config.branch_update_max_tries.max(1);
        for attempt in 1..=tries {
            let before = self.inner.refs.get_branch(repository, branch)?;
            let value = write(&before.staging_token)?;
            let after = self.inner.refs.get_branch(repository, branch)?;
            if after.staging_token == before.staging_token {
                return Ok(value);
            }
            if after.commit_id != before.commit_id && !after.staging_tokens().contains(&before.staging_token) {
                // committed and dropped already; the write recreated it
                self.drop_tokens(repository, branch, std::slice::from_ref(&before.staging_token));
            }
            debug!(repository = %repository, branch = %branch, attempt, "staging token changed during write, retrying");
        }
        Err(Error::TooManyTries {
            branch: branch.to_string(),
            attempts: tries,
        })
    }

    // ==================== Physical addresses ====================

    /// Issue a fresh address under the repository's namespace for an upload.
    pub fn get_physical_address(&self, repository: &RepositoryName) -> Result<String> {
        self.repository(repository)?;
        let link = LinkAddress {
            address: format!("data/{}", Ulid::new().to_string().to_lowercase()),
            issued_at: Utc::now(),
        };
        self.inner.refs.set_link_address(repository, &link)?;
        debug!(repository = %repository, address = %link.address, "issued physical address");
        Ok(link.address)
    }

    /// Stage `entry` at `path` after verifying its address was issued by
    /// [`Engine::get_physical_address`] and has not expired.
    pub fn link_physical_address(
        &self,
        repository: &RepositoryName,
        branch: &BranchName,
        path: &Key,
        entry: Entry,
    ) -> Result<()> {
        self.repository(repository)?;
        let address = entry.physical_address.clone();
        let link = self
            .inner
            .refs
            .get_link_address(repository, &address)?
            .ok_or_else(|| Error::LinkAddressNotFound(address.clone()))?;
        if Utc::now() - link.issued_at >= self.inner.config.link_address_expiry() {
            self.inner.refs.delete_link_address(repository, &address)?;
            return Err(Error::LinkAddressExpired(address));
        }
        self.stage_entry(repository, branch, path, entry)?;
        self.inner.refs.delete_link_address(repository, &address)?;
        Ok(())
    }

    /// Remove expired link records; returns how many were removed.
    pub fn delete_expired_link_addresses(&self, repository: &RepositoryName) -> Result<usize> {
        self.repository(repository)?;
        let expiry = self.inner.config.link_address_expiry();
        let now = Utc::now();
        let mut removed = 0;
        for link in self.inner.refs.list_link_addresses(repository)? {
            if now - link.issued_at >= expiry {
                self.inner.refs.delete_link_address(repository, &link.address)?;
                removed += 1;
            }
        }
        info!(repository = %repository, removed, "deleted expired link addresses");
        Ok(removed)
    }

    // ==================== Introspection ====================

    /// The range descriptors of a stored metarange.
    pub fn get_metarange(&self, repository: &RepositoryName, id: &MetaRangeId) -> Result<Vec<RangeDescriptor>> {
        let repo = self.repository(repository)?;
        self.inner.metaranges.read_metarange(&repo.storage_namespace, id)
    }

    /// The records of a stored range.
    pub fn get_range(&self, repository: &RepositoryName, id: &RangeId) -> Result<Vec<Record>> {
        let repo: Repository = self.repository(repository)?;
        Ok(self
            .inner
            .metaranges
            .ranges()
            .read_range(&repo.storage_namespace, id)?
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CommitParams, EngineConfig};
    use crate::storage::{MemoryBlobStore, MemoryKv};
    use std::sync::Arc;

    fn setup() -> (Engine, RepositoryName, BranchName) {
        let engine = Engine::in_memory();
        let repo = RepositoryName::new("repo").unwrap();
        engine
            .create_repository(&repo, "mem://repo", &BranchName::main())
            .unwrap();
        (engine, repo, BranchName::main())
    }

    fn key(s: &str) -> Key {
        Key::new(s).unwrap()
    }

    fn entry(addr: &str) -> Entry {
        Entry::new(addr, 3, "etag")
    }

    #[test]
    fn test_staging_shadows_committed() {
        let (engine, repo, main) = setup();
        engine.stage_entry(&repo, &main, &key("a"), entry("data/a1")).unwrap();
        engine.commit(&repo, &main, CommitParams::new("c1")).unwrap();

        engine.stage_entry(&repo, &main, &key("a"), entry("data/a2")).unwrap();
        assert_eq!(engine.get_entry(&repo, "main", "a").unwrap().physical_address, "data/a2");
        assert_eq!(engine.get_entry(&repo, "main@", "a").unwrap().physical_address, "data/a1");

        engine.delete_entry(&repo, &main, &key("a")).unwrap();
        assert!(engine.get_entry(&repo, "main", "a").unwrap_err().is_not_found());
        assert!(engine.delete_entry(&repo, &main, &key("a")).unwrap_err().is_not_found());

        engine.reset_entry(&repo, &main, &key("a")).unwrap();
        assert_eq!(engine.get_entry(&repo, "main", "a").unwrap().physical_address, "data/a1");
    }

    #[test]
    fn test_list_with_staging_and_delimiter() {
        let (engine, repo, main) = setup();
        for path in ["dir/a", "dir/b", "top"] {
            engine.stage_entry(&repo, &main, &key(path), entry(path)).unwrap();
        }
        engine.commit(&repo, &main, CommitParams::new("c1")).unwrap();
        engine.delete_entry(&repo, &main, &key("top")).unwrap();
        engine.stage_entry(&repo, &main, &key("new/x"), entry("x")).unwrap();

        let listing = engine
            .list_entries(&repo, "main", &ListOptions::default().delimiter("/"))
            .unwrap();
        let paths: Vec<&str> = listing.iter().map(Listing::path).collect();
        assert_eq!(paths, vec!["dir/", "new/"]);

        let committed = engine.list_entries(&repo, "main@", &ListOptions::default()).unwrap();
        let paths: Vec<&str> = committed.iter().map(Listing::path).collect();
        assert_eq!(paths, vec!["dir/a", "dir/b", "top"]);
    }

    #[test]
    fn test_batch_delete_collects_failures() {
        let (engine, repo, main) = setup();
        engine.stage_entry(&repo, &main, &key("a"), entry("data/a")).unwrap();
        let result = engine
            .delete_entries(&repo, &main, &[key("a"), key("missing")])
            .unwrap();
        assert_eq!(result.deleted, vec![key("a")]);
        assert_eq!(result.failed.len(), 1);
        assert!(result.failed[0].1.is_not_found());
    }

    #[test]
    fn test_reset_prefix() {
        let (engine, repo, main) = setup();
        for path in ["logs/1", "logs/2", "keep"] {
            engine.stage_entry(&repo, &main, &key(path), entry(path)).unwrap();
        }
        assert_eq!(engine.reset_prefix(&repo, &main, "logs/").unwrap(), 2);
        let listing = engine.list_entries(&repo, "main", &ListOptions::default()).unwrap();
        assert_eq!(listing.len(), 1);
    }

    #[test]
    fn test_write_racing_a_commit_is_redone() {
        let (engine, repo, main) = setup();
        engine.stage_entry(&repo, &main, &key("a"), entry("data/a")).unwrap();

        let mut attempts = 0;
        engine
            .write_staging(&repo, &main, |token| {
                attempts += 1;
                if attempts == 1 {
                    // the commit seals and drops the token this write targets
                    engine.commit(&repo, &main, CommitParams::new("c1"))?;
                }
                engine.inner.staging.set(token, &key("b"), Some(&entry("data/b")))
            })
            .unwrap();
        assert_eq!(attempts, 2);

        assert!(engine.get_entry(&repo, "main@", "b").unwrap_err().is_not_found());
        assert_eq!(engine.get_entry(&repo, "main", "b").unwrap().physical_address, "data/b");
        let branch = engine.get_branch(&repo, &main).unwrap();
        assert!(branch.sealed_tokens.is_empty());
        assert!(!engine.inner.staging.is_empty(&branch.staging_token).unwrap());
    }

    #[test]
    fn test_write_gives_up_when_token_keeps_moving() {
        let (engine, repo, main) = setup();
        let mut calls = 0;
        let err = engine
            .write_staging(&repo, &main, |token| {
                calls += 1;
                engine.update_branch_token(&repo, &main, StagingToken::generate())?;
                engine.inner.staging.set(token, &key("x"), Some(&entry("data/x")))
            })
            .unwrap_err();
        assert_eq!(calls, engine.inner.config.branch_update_max_tries);
        assert!(matches!(err, Error::TooManyTries { .. }));
    }

    #[test]
    fn test_link_physical_address() {
        let (engine, repo, main) = setup();
        let address = engine.get_physical_address(&repo).unwrap();
        assert!(address.starts_with("data/"));
        engine
            .link_physical_address(&repo, &main, &key("up"), entry(&address))
            .unwrap();
        assert_eq!(engine.get_entry(&repo, "main", "up").unwrap().physical_address, address);
        // consumed by the first link
        let err = engine
            .link_physical_address(&repo, &main, &key("up2"), entry(&address))
            .unwrap_err();
        assert!(matches!(err, Error::LinkAddressNotFound(_)));
    }

    #[test]
    fn test_expired_link_address() {
        let config = EngineConfig::default().link_address_expiry_secs(0);
        let engine = Engine::new(Arc::new(MemoryBlobStore::new()), Arc::new(MemoryKv::new()), config).unwrap();
        let repo = RepositoryName::new("repo").unwrap();
        let main = BranchName::main();
        engine.create_repository(&repo, "mem://repo", &main).unwrap();

        let address = engine.get_physical_address(&repo).unwrap();
        let err = engine
            .link_physical_address(&repo, &main, &key("up"), entry(&address))
            .unwrap_err();
        assert!(matches!(err, Error::LinkAddressExpired(_)));

        engine.get_physical_address(&repo).unwrap();
        engine.get_physical_address(&repo).unwrap();
        assert_eq!(engine.delete_expired_link_addresses(&repo).unwrap(), 2);
    }

    #[test]
    fn test_introspection() {
        let (engine, repo, main) = setup();
        engine.stage_entry(&repo, &main, &key("a"), entry("data/a")).unwrap();
        let commit = engine.commit(&repo, &main, CommitParams::new("c1")).unwrap();
        let ranges = engine.get_metarange(&repo, &commit.commit.metarange_id).unwrap();
        assert_eq!(ranges.len(), 1);
        let records = engine.get_range(&repo, &ranges[0].id).unwrap();
        assert_eq!(records[0].key, key("a"));
    }
}
