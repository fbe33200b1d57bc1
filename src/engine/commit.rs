//! Committing staged changes.
//!
//! A commit runs in two compare-and-swap steps so that writes arriving
//! while it is computed are never lost:
//!
//! 1. seal: the current staging token moves to the front of the branch's
//!    sealed tokens and a fresh token takes its place. New writes go to the
//!    fresh token from here on.
//! 2. apply: the sealed tokens are merged onto the HEAD snapshot, the commit
//!    is written, and the branch moves to it with the sealed tokens cleared.
//!
//! Readers see sealed tokens as part of the branch throughout, so the
//! branch's visible content never changes while a commit is in flight.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::cancel::CancelFlag;
use crate::engine::protection::ProtectedAction;
use crate::engine::retry::retry_branch_update;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::graph::{CommitBuilder, CommitGraph, CommitRecord};
use crate::refs::Branch;
use crate::storage::{BranchName, RepositoryName, StagingToken};

/// Commit message, author and options.
#[derive(Debug, Clone, Default)]
pub struct CommitParams {
    pub message: String,
    pub committer: String,
    pub metadata: BTreeMap<String, String>,
    /// commit even if nothing changed
    pub allow_empty: bool,
    pub creation_date: Option<DateTime<Utc>>,
}

impl CommitParams {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn committer(mut self, committer: impl Into<String>) -> Self {
        self.committer = committer.into();
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn allow_empty(mut self, allow: bool) -> Self {
        self.allow_empty = allow;
        self
    }

    pub fn creation_date(mut self, date: DateTime<Utc>) -> Self {
        self.creation_date = Some(date);
        self
    }

    pub(crate) fn builder(&self) -> CommitBuilder {
        let builder = CommitBuilder::new()
            .message(self.message.clone())
            .committer(self.committer.clone())
            .metadata(self.metadata.clone());
        match self.creation_date {
            Some(date) => builder.creation_date(date),
            None => builder,
        }
    }
}

impl Engine {
    /// Commit the branch's staged changes.
    pub fn commit(&self, repository: &RepositoryName, branch: &BranchName, params: CommitParams) -> Result<CommitRecord> {
        self.commit_with_cancel(repository, branch, params, &CancelFlag::new())
    }

    pub fn commit_with_cancel(
        &self,
        repository: &RepositoryName,
        branch: &BranchName,
        params: CommitParams,
        cancel: &CancelFlag,
    ) -> Result<CommitRecord> {
        let repo = self.repository(repository)?;
        self.check_protection(repository, branch, ProtectedAction::Commit)?;
        let max_tries = self.inner.config.branch_update_max_tries;
        let namespace = repo.storage_namespace.as_str();

        retry_branch_update(branch, max_tries, |_| self.seal_staging(repository, branch, params.allow_empty))?;

        let (record, used) = retry_branch_update(branch, max_tries, |attempt| {
            cancel.check()?;
            let (current, predicate) = self.inner.refs.get_branch_with_predicate(repository, branch)?;
            let sealed = current.sealed_tokens.clone();
            if sealed.is_empty() && !params.allow_empty {
                // a concurrent commit already took our changes
                return Err(Error::NoChanges);
            }

            let head = self.inner.commits.get_commit(namespace, &current.commit_id)?;
            let changes = self.staged_changes(&sealed)?;
            let (metarange, summary) =
                self.inner
                    .metaranges
                    .apply(namespace, &head.commit.metarange_id, changes, cancel)?;

            if summary.is_empty() && !params.allow_empty {
                let released = Branch {
                    sealed_tokens: Vec::new(),
                    ..current
                };
                self.inner
                    .refs
                    .update_branch(repository, branch, predicate, &released)?;
                self.drop_tokens(repository, branch, &sealed);
                return Err(Error::NoChanges);
            }

            let record = params
                .builder()
                .metarange(metarange)
                .parent(head.id.clone())
                .commit(&self.inner.commits, namespace)?;
            let moved = Branch {
                commit_id: record.id.clone(),
                staging_token: current.staging_token.clone(),
                sealed_tokens: Vec::new(),
            };
            self.inner.refs.update_branch(repository, branch, predicate, &moved)?;
            info!(
                repository = %repository,
                branch = %branch,
                commit_id = %record.id,
                added = summary.added,
                changed = summary.changed,
                removed = summary.removed,
                attempt,
                "committed"
            );
            Ok((record, sealed))
        })?;

        self.drop_tokens(repository, branch, &used);
        Ok(record)
    }

    /// Step one: freeze the current token. A no-op when it is empty.
    fn seal_staging(&self, repository: &RepositoryName, name: &BranchName, allow_empty: bool) -> Result<()> {
        let (branch, predicate) = self.inner.refs.get_branch_with_predicate(repository, name)?;
        if self.inner.staging.is_empty(&branch.staging_token)? {
            if branch.sealed_tokens.is_empty() && !allow_empty {
                return Err(Error::NoChanges);
            }
            return Ok(());
        }
        let mut sealed: Vec<StagingToken> = Vec::with_capacity(branch.sealed_tokens.len() + 1);
        sealed.push(branch.staging_token.clone());
        sealed.extend(branch.sealed_tokens.iter().cloned());
        let next = Branch {
            commit_id: branch.commit_id,
            staging_token: StagingToken::generate(),
            sealed_tokens: sealed,
        };
        self.inner.refs.update_branch(repository, name, predicate, &next)
    }
}
