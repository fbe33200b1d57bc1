//! Repository lifecycle.

use chrono::Utc;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::graph::CommitBuilder;
use crate::refs::{Branch, Repository, RepositoryState};
use crate::storage::{BranchName, RepositoryName};

/// message of the commit every new repository starts from
pub const INITIAL_COMMIT_MESSAGE: &str = "Repository created";

impl Engine {
    fn namespace_marker(&self) -> String {
        format!("{}/repository.json", self.prefix())
    }

    /// Create a repository with an empty initial commit on `default_branch`.
    pub fn create_repository(
        &self,
        name: &RepositoryName,
        storage_namespace: &str,
        default_branch: &BranchName,
    ) -> Result<Repository> {
        let repository = self.create_repository_record(name, storage_namespace, default_branch, true)?;
        let namespace = repository.storage_namespace.as_str();

        let empty = self.inner.metaranges.write_empty(namespace)?;
        let initial = CommitBuilder::new()
            .metarange(empty)
            .message(INITIAL_COMMIT_MESSAGE)
            .commit(&self.inner.commits, namespace)?;
        self.inner
            .refs
            .create_branch(name, default_branch, &Branch::new(initial.id.clone()))?;

        info!(repository = %name, namespace, commit_id = %initial.id, "created repository");
        Ok(repository)
    }

    /// Create a repository without commits or branches, ready for
    /// [`Engine::restore_refs`].
    ///
    /// The namespace may already hold data of an earlier repository; that
    /// is what a restore reads its commits from.
    pub fn create_bare_repository(
        &self,
        name: &RepositoryName,
        storage_namespace: &str,
        default_branch: &BranchName,
    ) -> Result<Repository> {
        let repository = self.create_repository_record(name, storage_namespace, default_branch, false)?;
        info!(repository = %name, namespace = storage_namespace, "created bare repository");
        Ok(repository)
    }

    fn create_repository_record(
        &self,
        name: &RepositoryName,
        storage_namespace: &str,
        default_branch: &BranchName,
        claim_namespace: bool,
    ) -> Result<Repository> {
        if storage_namespace.trim().is_empty() {
            return Err(Error::InvalidValue("storage namespace must not be empty".into()));
        }
        match self.inner.refs.get_repository(name) {
            Ok(_) => return Err(Error::RepositoryExists(name.to_string())),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let marker = self.namespace_marker();
        if claim_namespace && self.inner.store.exists(storage_namespace, &marker)? {
            return Err(Error::NamespaceInUse(storage_namespace.to_string()));
        }

        let repository = Repository {
            name: name.clone(),
            storage_namespace: storage_namespace.to_string(),
            default_branch: default_branch.clone(),
            creation_date: Utc::now(),
            state: RepositoryState::Active,
        };
        self.inner.refs.create_repository(&repository)?;
        if !claim_namespace {
            return Ok(repository);
        }
        let claimed = serde_json::to_vec(&repository)
            .map_err(Error::from)
            .and_then(|bytes| Ok(self.inner.store.put(storage_namespace, &marker, &bytes)?));
        if let Err(e) = claimed {
            if let Err(cleanup) = self.inner.refs.delete_repository(name) {
                warn!(repository = %name, error = %cleanup, "failed to remove repository record");
            }
            return Err(e);
        }
        Ok(repository)
    }

    pub fn get_repository(&self, name: &RepositoryName) -> Result<Repository> {
        self.repository(name)
    }

    /// Repositories ordered by name, starting after `after`.
    pub fn list_repositories(&self, after: Option<&RepositoryName>, limit: usize) -> Result<Vec<Repository>> {
        self.inner
            .refs
            .list_repositories(after.map(RepositoryName::as_str), limit)
    }

    /// Delete the repository's refs and staging areas.
    ///
    /// Data in the storage namespace stays in place; the namespace remains
    /// claimed so a new repository cannot silently adopt old objects.
    pub fn delete_repository(&self, name: &RepositoryName) -> Result<()> {
        self.repository(name)?;
        for (branch_name, branch) in self.inner.refs.list_branches(name, "", None, usize::MAX)? {
            for token in branch.staging_tokens() {
                if let Err(e) = self.inner.staging.drop_token(&token) {
                    warn!(repository = %name, branch = %branch_name, token = %token, error = %e, "failed to drop staging token");
                }
            }
        }
        self.inner.refs.delete_repository(name)?;
        info!(repository = %name, "deleted repository");
        Ok(())
    }
}
