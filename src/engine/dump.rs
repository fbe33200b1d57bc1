//! Ref dumps: a snapshot of a repository's branches and tags that can be
//! loaded into a bare repository over the same namespace.

use serde::{Deserialize, Serialize};
use tracing::info;
use ulid::Ulid;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::graph::CommitGraph;
use crate::refs::{Branch, Tag};
use crate::storage::{BranchName, CommitId, RepositoryName};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpedBranch {
    pub name: BranchName,
    pub commit_id: CommitId,
}

/// Branch HEADs and tags of a repository. Staged changes are not part of
/// a dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefsDump {
    pub default_branch: BranchName,
    pub branches: Vec<DumpedBranch>,
    pub tags: Vec<Tag>,
}

impl Engine {
    /// Write a dump of the repository's refs into its namespace and return
    /// the dump's location.
    pub fn dump_refs(&self, repository: &RepositoryName) -> Result<String> {
        let repo = self.repository(repository)?;
        let branches = self
            .inner
            .refs
            .list_branches(repository, "", None, usize::MAX)?
            .into_iter()
            .map(|(name, branch)| DumpedBranch {
                name,
                commit_id: branch.commit_id,
            })
            .collect();
        let tags = self.inner.refs.list_tags(repository, "", None, usize::MAX)?;
        let dump = RefsDump {
            default_branch: repo.default_branch.clone(),
            branches,
            tags,
        };

        let location = format!("{}/refs_dump/{}.json", self.prefix(), Ulid::new().to_string().to_lowercase());
        self.inner
            .store
            .put(&repo.storage_namespace, &location, &serde_json::to_vec(&dump)?)?;
        info!(
            repository = %repository,
            branches = dump.branches.len(),
            tags = dump.tags.len(),
            location = %location,
            "dumped refs"
        );
        Ok(location)
    }

    pub fn read_refs_dump(&self, repository: &RepositoryName, location: &str) -> Result<RefsDump> {
        let repo = self.repository(repository)?;
        let bytes = self.inner.store.get(&repo.storage_namespace, location)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Recreate the dumped branches and tags. The repository must have no
    /// branches, and every dumped commit must exist in its namespace.
    pub fn restore_refs(&self, repository: &RepositoryName, dump: &RefsDump) -> Result<()> {
        let repo = self.repository(repository)?;
        if !self.inner.refs.list_branches(repository, "", None, 1)?.is_empty() {
            return Err(Error::InvalidValue(format!(
                "repository {} already has branches; restore needs a bare repository",
                repository
            )));
        }

        let namespace = repo.storage_namespace.as_str();
        let targets = dump
            .branches
            .iter()
            .map(|b| &b.commit_id)
            .chain(dump.tags.iter().map(|t| &t.commit_id));
        for commit_id in targets {
            self.inner.commits.get_commit(namespace, commit_id)?;
        }

        for branch in &dump.branches {
            self.inner
                .refs
                .create_branch(repository, &branch.name, &Branch::new(branch.commit_id.clone()))?;
        }
        for tag in &dump.tags {
            self.inner.refs.create_tag(repository, tag)?;
        }
        info!(
            repository = %repository,
            branches = dump.branches.len(),
            tags = dump.tags.len(),
            "restored refs"
        );
        Ok(())
    }
}
