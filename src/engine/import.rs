//! Bulk import: snapshots built outside staging and committed as a whole,
//! plus server-side entry copies.

use chrono::Utc;
use tracing::{debug, info};

use crate::committed::RangeDescriptor;
use crate::engine::commit::CommitParams;
use crate::engine::protection::ProtectedAction;
use crate::engine::retry::retry_branch_update;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::graph::{CommitGraph, CommitRecord};
use crate::refs::Branch;
use crate::storage::{BranchName, Entry, Key, MetaRangeId, RangeId, Record, RepositoryName};

impl Engine {
    /// Write strictly ascending records as ranges of the repository.
    pub fn write_ranges(
        &self,
        repository: &RepositoryName,
        records: impl IntoIterator<Item = Record>,
    ) -> Result<Vec<RangeDescriptor>> {
        let repo = self.repository(repository)?;
        self.inner
            .metaranges
            .ranges()
            .write_range(&repo.storage_namespace, records)
    }

    /// Assemble stored ranges into a metarange.
    ///
    /// Bounds come from each range's stored header; a range missing from
    /// the namespace fails with [`Error::RangeNotFound`].
    pub fn create_metarange(&self, repository: &RepositoryName, ranges: &[RangeId]) -> Result<MetaRangeId> {
        let repo = self.repository(repository)?;
        let namespace = repo.storage_namespace.as_str();
        let descriptors = ranges
            .iter()
            .map(|id| self.inner.metaranges.ranges().range_bounds(namespace, id))
            .collect::<Result<Vec<_>>>()?;
        let id = self.inner.metaranges.write_metarange(namespace, descriptors)?;
        debug!(repository = %repository, metarange_id = %id, ranges = ranges.len(), "created metarange");
        Ok(id)
    }

    /// Commit `metarange` on top of the branch HEAD, replacing the whole
    /// snapshot. The branch must have nothing staged.
    pub fn commit_metarange(
        &self,
        repository: &RepositoryName,
        branch: &BranchName,
        metarange: &MetaRangeId,
        params: CommitParams,
    ) -> Result<CommitRecord> {
        let repo = self.repository(repository)?;
        self.check_protection(repository, branch, ProtectedAction::Commit)?;
        let namespace = repo.storage_namespace.as_str();
        self.inner.metaranges.read_metarange(namespace, metarange)?;
        let max_tries = self.inner.config.branch_update_max_tries;

        retry_branch_update(branch, max_tries, |attempt| {
            let (current, predicate) = self.inner.refs.get_branch_with_predicate(repository, branch)?;
            if !self.staging_is_clean(&current.staging_tokens())? {
                return Err(Error::DirtyBranch {
                    branch: branch.to_string(),
                });
            }
            let head = self.inner.commits.get_commit(namespace, &current.commit_id)?;
            if &head.commit.metarange_id == metarange && !params.allow_empty {
                return Err(Error::NoChanges);
            }

            let record = params
                .builder()
                .metarange(metarange.clone())
                .parent(head.id.clone())
                .commit(&self.inner.commits, namespace)?;
            let moved = Branch {
                commit_id: record.id.clone(),
                ..current
            };
            self.inner.refs.update_branch(repository, branch, predicate, &moved)?;
            info!(
                repository = %repository,
                branch = %branch,
                metarange_id = %metarange,
                commit_id = %record.id,
                attempt,
                "committed metarange"
            );
            Ok(record)
        })
    }

    /// Stage a copy of the entry at `source_path` on `source_ref` under
    /// `destination_path`. The object is shared, not duplicated.
    pub fn copy_entry(
        &self,
        repository: &RepositoryName,
        source_ref: &str,
        source_path: &str,
        destination: &BranchName,
        destination_path: &Key,
    ) -> Result<Entry> {
        let mut entry = self.get_entry(repository, source_ref, source_path)?;
        entry.last_modified = Utc::now();
        self.stage_entry(repository, destination, destination_path, entry.clone())?;
        debug!(
            repository = %repository,
            source = %source_ref,
            source_path,
            branch = %destination,
            path = %destination_path,
            "copied entry"
        );
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Engine, RepositoryName, BranchName) {
        let engine = Engine::in_memory();
        let repo = RepositoryName::new("repo").unwrap();
        engine
            .create_repository(&repo, "mem://repo", &BranchName::main())
            .unwrap();
        (engine, repo, BranchName::main())
    }

    fn record(path: &str) -> Record {
        Record::new(Key::new(path).unwrap(), Entry::new(format!("data/{}", path), 1, "c"))
    }

    #[test]
    fn test_import_replaces_snapshot() {
        let (engine, repo, main) = setup();
        engine
            .stage_entry(&repo, &main, &Key::new("old").unwrap(), Entry::new("data/old", 1, "c"))
            .unwrap();
        let first = engine.commit(&repo, &main, CommitParams::new("c1")).unwrap();

        let ranges = engine
            .write_ranges(&repo, vec![record("imported/a"), record("imported/b")])
            .unwrap();
        let ids: Vec<RangeId> = ranges.iter().map(|r| r.id.clone()).collect();
        let metarange = engine.create_metarange(&repo, &ids).unwrap();
        assert_eq!(engine.get_metarange(&repo, &metarange).unwrap(), ranges);

        let record = engine
            .commit_metarange(&repo, &main, &metarange, CommitParams::new("import"))
            .unwrap();
        assert_eq!(record.commit.parents, vec![first.id]);
        assert_eq!(engine.get_branch(&repo, &main).unwrap().commit_id, record.id);
        assert!(engine.get_entry(&repo, "main", "old").unwrap_err().is_not_found());
        assert_eq!(
            engine.get_entry(&repo, "main", "imported/b").unwrap().physical_address,
            "data/imported/b"
        );

        // same snapshot again
        let err = engine
            .commit_metarange(&repo, &main, &metarange, CommitParams::new("again"))
            .unwrap_err();
        assert!(matches!(err, Error::NoChanges));
    }

    #[test]
    fn test_create_metarange_needs_stored_ranges() {
        let (engine, repo, _) = setup();
        let missing = RangeId::from_hex(&"7".repeat(64)).unwrap();
        let err = engine.create_metarange(&repo, &[missing]).unwrap_err();
        assert!(matches!(err, Error::RangeNotFound(_)));
    }

    #[test]
    fn test_commit_metarange_rejects_dirty_branch() {
        let (engine, repo, main) = setup();
        let ranges = engine.write_ranges(&repo, vec![record("a")]).unwrap();
        let metarange = engine.create_metarange(&repo, &[ranges[0].id.clone()]).unwrap();
        engine
            .stage_entry(&repo, &main, &Key::new("pending").unwrap(), Entry::new("data/p", 1, "c"))
            .unwrap();
        let before = engine.get_branch(&repo, &main).unwrap();

        let err = engine
            .commit_metarange(&repo, &main, &metarange, CommitParams::new("import"))
            .unwrap_err();
        assert!(matches!(err, Error::DirtyBranch { .. }));
        assert_eq!(engine.get_branch(&repo, &main).unwrap(), before);

        let unknown = MetaRangeId::from_hex(&"9".repeat(64)).unwrap();
        engine.reset_branch(&repo, &main).unwrap();
        let err = engine
            .commit_metarange(&repo, &main, &unknown, CommitParams::new("import"))
            .unwrap_err();
        assert!(matches!(err, Error::MetaRangeNotFound(_)));
    }

    #[test]
    fn test_copy_entry() {
        let (engine, repo, main) = setup();
        let source = Entry::new("data/src", 42, "etag");
        engine
            .stage_entry(&repo, &main, &Key::new("src").unwrap(), source.clone())
            .unwrap();
        engine.commit(&repo, &main, CommitParams::new("c1")).unwrap();
        let dev = BranchName::new("dev").unwrap();
        engine.create_branch(&repo, &dev, "main").unwrap();

        let copied = engine
            .copy_entry(&repo, "main", "src", &dev, &Key::new("dst").unwrap())
            .unwrap();
        assert_eq!(copied.physical_address, "data/src");
        assert_eq!(copied.size, 42);

        let staged = engine.get_entry(&repo, "dev", "dst").unwrap();
        assert_eq!(staged.physical_address, source.physical_address);
        assert!(engine.get_entry(&repo, "main", "dst").unwrap_err().is_not_found());

        let err = engine
            .copy_entry(&repo, "main", "missing", &dev, &Key::new("x").unwrap())
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
