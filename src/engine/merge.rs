//! Merge, revert, cherry-pick, diff and history.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::cancel::CancelFlag;
use crate::committed::{ListOptions, RecordIterator, VecRecordIterator};
use crate::engine::retry::retry_branch_update;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::graph::{find_merge_base, CommitGraph, CommitLog, CommitRecord, LogOptions};
use crate::merge::{list_diff, three_way_merge, DiffIterator, Difference, MergeOptions};
use crate::refs::{Branch, Repository};
use crate::storage::{BranchName, CommitId, MetaRangeId, RepositoryName};

/// Options for merge, revert and cherry-pick commits.
#[derive(Debug, Clone, Default)]
pub struct MergeParams {
    /// commit message; a default describing the operation when `None`
    pub message: Option<String>,
    pub committer: String,
    pub metadata: BTreeMap<String, String>,
    pub options: MergeOptions,
}

impl MergeParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn committer(mut self, committer: impl Into<String>) -> Self {
        self.committer = committer.into();
        self
    }

    pub fn options(mut self, options: MergeOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogParams {
    pub first_parent_only: bool,
    pub limit: Option<usize>,
    pub since: Option<DateTime<Utc>>,
    /// keep only commits that changed something under one of these
    /// paths or prefixes, compared to their first parent
    pub paths: Vec<String>,
}

/// Inputs of a three-way merge, by snapshot.
struct MergeInputs<'a> {
    base: Option<&'a MetaRangeId>,
    source: Option<&'a MetaRangeId>,
    dest: &'a MetaRangeId,
}

impl Engine {
    /// A cursor over `metarange`, or over nothing when absent.
    fn snapshot_iterator(&self, repo: &Repository, metarange: Option<&MetaRangeId>) -> Result<Box<dyn RecordIterator>> {
        match metarange {
            Some(id) => Ok(Box::new(self.inner.metaranges.entries(&repo.storage_namespace, id)?)),
            None => Ok(Box::new(VecRecordIterator::new(Vec::new()))),
        }
    }

    /// Run the merge and write the resulting snapshot onto `dest`.
    fn merge_snapshots(
        &self,
        repo: &Repository,
        inputs: MergeInputs<'_>,
        options: &MergeOptions,
        cancel: &CancelFlag,
    ) -> Result<(MetaRangeId, usize)> {
        let outcome = three_way_merge(
            self.snapshot_iterator(repo, inputs.base)?,
            self.snapshot_iterator(repo, inputs.source)?,
            self.snapshot_iterator(repo, inputs.base)?,
            self.snapshot_iterator(repo, Some(inputs.dest))?,
            options,
            cancel,
        )?;
        let changes = outcome.into_changes()?;
        let (metarange, summary) = self.inner.metaranges.apply(
            &repo.storage_namespace,
            inputs.dest,
            changes.into_iter().map(Ok),
            cancel,
        )?;
        Ok((metarange, summary.total()))
    }

    fn require_clean(&self, branch_name: &BranchName, branch: &Branch) -> Result<()> {
        if !self.staging_is_clean(&branch.staging_tokens())? {
            return Err(Error::DirtyBranch {
                branch: branch_name.to_string(),
            });
        }
        Ok(())
    }

    /// Merge the commit `source` resolves to into `destination`.
    pub fn merge(
        &self,
        repository: &RepositoryName,
        destination: &BranchName,
        source: &str,
        params: MergeParams,
        cancel: &CancelFlag,
    ) -> Result<CommitRecord> {
        let repo = self.repository(repository)?;
        let namespace = repo.storage_namespace.as_str();
        let source_id = self.inner.resolver.resolve(&repo, source)?.commit_id;
        let max_tries = self.inner.config.branch_update_max_tries;

        retry_branch_update(destination, max_tries, |_| {
            let (branch, predicate) = self.inner.refs.get_branch_with_predicate(repository, destination)?;
            self.require_clean(destination, &branch)?;

            let dest = self.inner.commits.get_commit(namespace, &branch.commit_id)?;
            let src = self.inner.commits.get_commit(namespace, &source_id)?;
            let base = find_merge_base(&self.inner.commits, namespace, &src.id, &dest.id, cancel)?.ok_or_else(|| {
                Error::NoMergeBase {
                    left: src.id.to_string(),
                    right: dest.id.to_string(),
                }
            })?;
            if base.id == src.id {
                return Err(Error::NoChanges);
            }

            let (metarange, _) = self.merge_snapshots(
                &repo,
                MergeInputs {
                    base: Some(&base.commit.metarange_id),
                    source: Some(&src.commit.metarange_id),
                    dest: &dest.commit.metarange_id,
                },
                &params.options,
                cancel,
            )?;
            let message = params
                .message
                .clone()
                .unwrap_or_else(|| format!("Merge '{}' into '{}'", source, destination));
            let mut metadata = params.metadata.clone();
            metadata.insert(".merge.strategy".to_string(), params.options.strategy.to_string());
            let record = crate::graph::CommitBuilder::new()
                .metarange(metarange)
                .parents(vec![dest.id.clone(), src.id.clone()])
                .message(message)
                .committer(params.committer.clone())
                .metadata(metadata)
                .commit(&self.inner.commits, namespace)?;

            let moved = Branch {
                commit_id: record.id.clone(),
                ..branch
            };
            self.inner.refs.update_branch(repository, destination, predicate, &moved)?;
            info!(
                repository = %repository,
                branch = %destination,
                source = %src.id,
                base = %base.id,
                commit_id = %record.id,
                "merged"
            );
            Ok(record)
        })
    }

    /// Undo the changes `commit` introduced relative to its parent number
    /// `parent` (1-based; 0 selects the only parent of a non-merge commit).
    pub fn revert(
        &self,
        repository: &RepositoryName,
        branch: &BranchName,
        commit: &str,
        parent: usize,
        params: MergeParams,
        cancel: &CancelFlag,
    ) -> Result<CommitRecord> {
        self.apply_commit_delta(repository, branch, commit, parent, params, cancel, Direction::Revert)
    }

    /// Re-apply the changes `commit` introduced onto `branch`.
    pub fn cherry_pick(
        &self,
        repository: &RepositoryName,
        branch: &BranchName,
        commit: &str,
        parent: usize,
        params: MergeParams,
        cancel: &CancelFlag,
    ) -> Result<CommitRecord> {
        self.apply_commit_delta(repository, branch, commit, parent, params, cancel, Direction::CherryPick)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_commit_delta(
        &self,
        repository: &RepositoryName,
        branch_name: &BranchName,
        commit: &str,
        parent: usize,
        params: MergeParams,
        cancel: &CancelFlag,
        direction: Direction,
    ) -> Result<CommitRecord> {
        let repo = self.repository(repository)?;
        let namespace = repo.storage_namespace.as_str();
        let picked_id = self.inner.resolver.resolve(&repo, commit)?.commit_id;
        let picked = self.inner.commits.get_commit(namespace, &picked_id)?;
        let parent_id = select_parent(&picked, parent)?;
        let parent_metarange = match &parent_id {
            Some(id) => Some(self.inner.commits.get_commit(namespace, id)?.commit.metarange_id),
            None => None,
        };
        let max_tries = self.inner.config.branch_update_max_tries;

        retry_branch_update(branch_name, max_tries, |_| {
            let (branch, predicate) = self.inner.refs.get_branch_with_predicate(repository, branch_name)?;
            self.require_clean(branch_name, &branch)?;
            let head = self.inner.commits.get_commit(namespace, &branch.commit_id)?;

            let (base, source) = match direction {
                Direction::Revert => (Some(&picked.commit.metarange_id), parent_metarange.as_ref()),
                Direction::CherryPick => (parent_metarange.as_ref(), Some(&picked.commit.metarange_id)),
            };
            let (metarange, changed) = self.merge_snapshots(
                &repo,
                MergeInputs {
                    base,
                    source,
                    dest: &head.commit.metarange_id,
                },
                &params.options,
                cancel,
            )?;
            if changed == 0 {
                return Err(Error::NoChanges);
            }

            let message = params.message.clone().unwrap_or_else(|| match direction {
                Direction::Revert => format!("Revert {}", picked.id),
                Direction::CherryPick => picked.commit.message.clone(),
            });
            let mut metadata = params.metadata.clone();
            metadata.insert(direction.metadata_key().to_string(), picked.id.to_string());
            let record = crate::graph::CommitBuilder::new()
                .metarange(metarange)
                .parent(head.id.clone())
                .message(message)
                .committer(params.committer.clone())
                .metadata(metadata)
                .commit(&self.inner.commits, namespace)?;

            let moved = Branch {
                commit_id: record.id.clone(),
                ..branch
            };
            self.inner.refs.update_branch(repository, branch_name, predicate, &moved)?;
            info!(
                repository = %repository,
                branch = %branch_name,
                picked = %picked.id,
                commit_id = %record.id,
                operation = direction.name(),
                "applied commit delta"
            );
            Ok(record)
        })
    }

    /// Two-dot diff: everything that differs between `left` and `right`.
    pub fn diff(
        &self,
        repository: &RepositoryName,
        left: &str,
        right: &str,
        options: &ListOptions,
        cancel: &CancelFlag,
    ) -> Result<Vec<Difference>> {
        let repo = self.repository(repository)?;
        let left = self.inner.resolver.resolve(&repo, left)?;
        let right = self.inner.resolver.resolve(&repo, right)?;
        let mut diff = DiffIterator::new(
            self.ref_iterator(&repo, &left)?,
            self.ref_iterator(&repo, &right)?,
            cancel.clone(),
        );
        list_diff(&mut diff, options)
    }

    /// Three-dot diff: what `right` changed since its merge base with `left`.
    pub fn compare(
        &self,
        repository: &RepositoryName,
        left: &str,
        right: &str,
        options: &ListOptions,
        cancel: &CancelFlag,
    ) -> Result<Vec<Difference>> {
        let repo = self.repository(repository)?;
        let (_, right_id, base) = self.merge_base_of(&repo, left, right, cancel)?;
        let right_metarange = self.metarange_of(&repo, &right_id)?;
        let mut diff = DiffIterator::new(
            self.snapshot_iterator(&repo, Some(&base.commit.metarange_id))?,
            self.snapshot_iterator(&repo, Some(&right_metarange))?,
            cancel.clone(),
        );
        list_diff(&mut diff, options)
    }

    /// Best common ancestor of two refs, with the commits they resolved to.
    pub fn find_merge_base(
        &self,
        repository: &RepositoryName,
        left: &str,
        right: &str,
        cancel: &CancelFlag,
    ) -> Result<(CommitId, CommitId, CommitRecord)> {
        let repo = self.repository(repository)?;
        self.merge_base_of(&repo, left, right, cancel)
    }

    fn merge_base_of(
        &self,
        repo: &Repository,
        left: &str,
        right: &str,
        cancel: &CancelFlag,
    ) -> Result<(CommitId, CommitId, CommitRecord)> {
        let left_id = self.inner.resolver.resolve(repo, left)?.commit_id;
        let right_id = self.inner.resolver.resolve(repo, right)?.commit_id;
        let base = find_merge_base(&self.inner.commits, &repo.storage_namespace, &left_id, &right_id, cancel)?
            .ok_or_else(|| Error::NoMergeBase {
                left: left_id.to_string(),
                right: right_id.to_string(),
            })?;
        Ok((left_id, right_id, base))
    }

    /// Commits reachable from `reference`, newest first.
    pub fn log(
        &self,
        repository: &RepositoryName,
        reference: &str,
        params: &LogParams,
        cancel: &CancelFlag,
    ) -> Result<Vec<CommitRecord>> {
        let repo = self.repository(repository)?;
        let from = self.inner.resolver.resolve(&repo, reference)?.commit_id;
        let options = LogOptions {
            first_parent_only: params.first_parent_only,
            limit: params.limit,
            since: params.since,
        };
        let log = CommitLog::new(&self.inner.commits, &repo.storage_namespace, &from, options, cancel.clone())?;
        let log = if params.paths.is_empty() {
            log
        } else {
            let repo = &repo;
            log.with_filter(Box::new(move |record: &CommitRecord| {
                self.touches_paths(repo, record, &params.paths, cancel)
            }))
        };
        log.collect()
    }

    /// true if `record` changed anything under one of `paths` compared to
    /// its first parent
    fn touches_paths(
        &self,
        repo: &Repository,
        record: &CommitRecord,
        paths: &[String],
        cancel: &CancelFlag,
    ) -> Result<bool> {
        let parent_metarange = match record.first_parent() {
            Some(parent) => Some(self.metarange_of(repo, parent)?),
            None => None,
        };
        if parent_metarange.as_ref() == Some(&record.commit.metarange_id) {
            return Ok(false);
        }
        for path in paths {
            let mut diff = DiffIterator::new(
                self.snapshot_iterator(repo, parent_metarange.as_ref())?,
                self.snapshot_iterator(repo, Some(&record.commit.metarange_id))?,
                cancel.clone(),
            );
            diff.seek_ge(path)?;
            if let Some(first) = diff.next().transpose()? {
                if first.path.starts_with(path.as_str()) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Revert,
    CherryPick,
}

impl Direction {
    fn name(self) -> &'static str {
        match self {
            Direction::Revert => "revert",
            Direction::CherryPick => "cherry-pick",
        }
    }

    fn metadata_key(self) -> &'static str {
        match self {
            Direction::Revert => ".revert.commit",
            Direction::CherryPick => ".cherry_pick.commit",
        }
    }
}

/// The parent a revert or cherry-pick compares against; `None` for a root
/// commit.
fn select_parent(commit: &CommitRecord, parent: usize) -> Result<Option<CommitId>> {
    let parents = &commit.commit.parents;
    if parents.len() > 1 {
        if parent == 0 || parent > parents.len() {
            return Err(Error::InvalidValue(format!(
                "commit {} is a merge with {} parents; choose a parent number between 1 and {}",
                commit.id,
                parents.len(),
                parents.len()
            )));
        }
        return Ok(Some(parents[parent - 1].clone()));
    }
    if parent > 1 {
        return Err(Error::InvalidValue(format!(
            "commit {} has no parent number {}",
            commit.id, parent
        )));
    }
    Ok(parents.first().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CommitParams;
    use crate::merge::{DiffType, MergeStrategy};
    use crate::storage::{Entry, Key};

    struct Repo {
        engine: Engine,
        name: RepositoryName,
    }

    impl Repo {
        fn new() -> Self {
            let engine = Engine::in_memory();
            let name = RepositoryName::new("repo").unwrap();
            engine
                .create_repository(&name, "mem://repo", &BranchName::main())
                .unwrap();
            Self { engine, name }
        }

        fn branch(&self, name: &str, from: &str) -> BranchName {
            let branch = BranchName::new(name).unwrap();
            self.engine.create_branch(&self.name, &branch, from).unwrap();
            branch
        }

        fn put(&self, branch: &BranchName, path: &str, addr: &str) {
            self.engine
                .stage_entry(&self.name, branch, &Key::new(path).unwrap(), Entry::new(addr, 1, "c"))
                .unwrap();
        }

        fn delete(&self, branch: &BranchName, path: &str) {
            self.engine
                .delete_entry(&self.name, branch, &Key::new(path).unwrap())
                .unwrap();
        }

        fn commit(&self, branch: &BranchName, message: &str) -> CommitRecord {
            self.engine
                .commit(&self.name, branch, CommitParams::new(message))
                .unwrap()
        }

        fn read(&self, reference: &str, path: &str) -> Option<String> {
            self.engine
                .get_entry(&self.name, reference, path)
                .ok()
                .map(|e| e.physical_address)
        }
    }

    #[test]
    fn test_merge_and_no_changes() {
        let r = Repo::new();
        let main = BranchName::main();
        r.put(&main, "a", "1");
        r.commit(&main, "base");
        let feature = r.branch("feature", "main");
        r.put(&feature, "b", "2");
        r.commit(&feature, "feature");

        let merged = r
            .engine
            .merge(&r.name, &main, "feature", MergeParams::new(), &CancelFlag::new())
            .unwrap();
        assert_eq!(merged.commit.parents.len(), 2);
        assert_eq!(merged.commit.message, "Merge 'feature' into 'main'");
        assert_eq!(r.read("main", "b").as_deref(), Some("2"));

        let err = r
            .engine
            .merge(&r.name, &main, "feature", MergeParams::new(), &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, Error::NoChanges));
    }

    #[test]
    fn test_merge_into_dirty_branch() {
        let r = Repo::new();
        let main = BranchName::main();
        let feature = r.branch("feature", "main");
        r.put(&feature, "b", "2");
        r.commit(&feature, "feature");
        r.put(&main, "dirty", "x");
        let err = r
            .engine
            .merge(&r.name, &main, "feature", MergeParams::new(), &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, Error::DirtyBranch { .. }));
    }

    #[test]
    fn test_merge_strategy_resolves_conflict() {
        let r = Repo::new();
        let main = BranchName::main();
        r.put(&main, "x", "base");
        r.commit(&main, "base");
        let feature = r.branch("feature", "main");
        r.put(&feature, "x", "theirs");
        r.commit(&feature, "feature");
        r.put(&main, "x", "ours");
        r.commit(&main, "main");

        let params = MergeParams::new().options(MergeOptions {
            strategy: MergeStrategy::SourceWins,
            ..MergeOptions::default()
        });
        r.engine
            .merge(&r.name, &main, "feature", params, &CancelFlag::new())
            .unwrap();
        assert_eq!(r.read("main", "x").as_deref(), Some("theirs"));
    }

    #[test]
    fn test_revert_and_cherry_pick() {
        let r = Repo::new();
        let main = BranchName::main();
        r.put(&main, "a", "1");
        r.commit(&main, "c1");
        r.put(&main, "b", "2");
        r.delete(&main, "a");
        let c2 = r.commit(&main, "c2");

        r.engine
            .revert(&r.name, &main, c2.id.as_str(), 0, MergeParams::new(), &CancelFlag::new())
            .unwrap();
        assert_eq!(r.read("main", "a").as_deref(), Some("1"));
        assert_eq!(r.read("main", "b"), None);

        let other = r.branch("other", "main");
        let picked = r
            .engine
            .cherry_pick(&r.name, &other, c2.id.as_str(), 0, MergeParams::new(), &CancelFlag::new())
            .unwrap();
        assert_eq!(picked.commit.parents.len(), 1);
        assert_eq!(picked.commit.message, "c2");
        assert_eq!(r.read("other", "b").as_deref(), Some("2"));
        assert_eq!(r.read("other", "a"), None);
    }

    #[test]
    fn test_revert_merge_requires_parent_number() {
        let r = Repo::new();
        let main = BranchName::main();
        let feature = r.branch("feature", "main");
        r.put(&feature, "f", "1");
        r.commit(&feature, "feature");
        r.put(&main, "m", "1");
        r.commit(&main, "main");
        let merge = r
            .engine
            .merge(&r.name, &main, "feature", MergeParams::new(), &CancelFlag::new())
            .unwrap();

        let err = r
            .engine
            .revert(&r.name, &main, merge.id.as_str(), 0, MergeParams::new(), &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidValue(_)));

        r.engine
            .revert(&r.name, &main, merge.id.as_str(), 1, MergeParams::new(), &CancelFlag::new())
            .unwrap();
        assert_eq!(r.read("main", "f"), None);
        assert_eq!(r.read("main", "m").as_deref(), Some("1"));
    }

    #[test]
    fn test_diff_compare_and_log() {
        let r = Repo::new();
        let main = BranchName::main();
        r.put(&main, "docs/a", "1");
        r.commit(&main, "docs");
        let feature = r.branch("feature", "main");
        r.put(&feature, "src/x", "1");
        r.commit(&feature, "src");
        r.put(&main, "docs/b", "2");
        r.commit(&main, "more docs");

        let cancel = CancelFlag::new();
        let two_dot = r
            .engine
            .diff(&r.name, "main", "feature", &ListOptions::default(), &cancel)
            .unwrap();
        let summary: Vec<(&str, DiffType)> = two_dot.iter().map(|d| (d.path.as_str(), d.diff_type)).collect();
        assert_eq!(summary, vec![("docs/b", DiffType::Removed), ("src/x", DiffType::Added)]);

        let three_dot = r
            .engine
            .compare(&r.name, "main", "feature", &ListOptions::default(), &cancel)
            .unwrap();
        let summary: Vec<&str> = three_dot.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(summary, vec!["src/x"]);

        // staged changes show up in a branch diff
        r.put(&main, "docs/c", "3");
        let staged = r
            .engine
            .diff(&r.name, "main@", "main", &ListOptions::default(), &cancel)
            .unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].path, "docs/c");

        let params = LogParams {
            paths: vec!["docs/".to_string()],
            ..LogParams::default()
        };
        let messages: Vec<String> = r
            .engine
            .log(&r.name, "main", &params, &cancel)
            .unwrap()
            .into_iter()
            .map(|c| c.commit.message)
            .collect();
        assert_eq!(messages, vec!["more docs", "docs"]);

        let all = r.engine.log(&r.name, "main", &LogParams::default(), &cancel).unwrap();
        assert_eq!(all.len(), 3);

        let (_, _, base) = r.engine.find_merge_base(&r.name, "main", "feature", &cancel).unwrap();
        assert_eq!(base.commit.message, "docs");
    }
}
