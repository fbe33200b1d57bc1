//! Repository, branch and tag records.
//!
//! Refs are the only mutable state of a repository. They live in the kv
//! store, one partition per repository:
//! - `branches/{name}`: HEAD commit plus staging tokens
//! - `tags/{name}`: commit id, immutable once created
//! - `settings/{name}`: repository settings (GC rules, protection rules)
//! - `links/{address}`: physical addresses issued for upload
//!
//! Branch updates are compare-and-swap on the record's predicate, so a
//! writer that lost a race sees [`StorageError::PredicateFailed`] and can
//! re-read and retry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::storage::{
    get_json, scan_json, set_json, set_json_if, BranchName, CommitId, KvStore, Predicate, RepositoryName,
    StagingToken, StorageError, TagName,
};

const REPOSITORIES: &str = "repositories";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryState {
    #[default]
    Active,
    /// deletion started; the repository is invisible to readers
    InDeletion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: RepositoryName,
    pub storage_namespace: String,
    pub default_branch: BranchName,
    pub creation_date: DateTime<Utc>,
    #[serde(default)]
    pub state: RepositoryState,
}

/// The mutable record of a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub commit_id: CommitId,
    pub staging_token: StagingToken,
    /// tokens frozen by in-flight commits, newest first
    #[serde(default)]
    pub sealed_tokens: Vec<StagingToken>,
}

impl Branch {
    pub fn new(commit_id: CommitId) -> Self {
        Self {
            commit_id,
            staging_token: StagingToken::generate(),
            sealed_tokens: Vec::new(),
        }
    }

    /// current token first, then sealed tokens newest first
    pub fn staging_tokens(&self) -> Vec<StagingToken> {
        let mut tokens = Vec::with_capacity(1 + self.sealed_tokens.len());
        tokens.push(self.staging_token.clone());
        tokens.extend(self.sealed_tokens.iter().cloned());
        tokens
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: TagName,
    pub commit_id: CommitId,
}

/// A physical address handed out for a pending upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkAddress {
    pub address: String,
    pub issued_at: DateTime<Utc>,
}

/// Manages refs in a kv store.
#[derive(Clone)]
pub struct RefManager {
    kv: Arc<dyn KvStore>,
    page_size: usize,
}

impl RefManager {
    pub fn new(kv: Arc<dyn KvStore>, page_size: usize) -> Self {
        Self {
            kv,
            page_size: page_size.max(1),
        }
    }

    fn partition(repository: &RepositoryName) -> String {
        format!("repo/{}", repository)
    }

    fn branch_key(branch: &BranchName) -> String {
        format!("branches/{}", branch)
    }

    fn tag_key(tag: &TagName) -> String {
        format!("tags/{}", tag)
    }

    // ==================== Repositories ====================

    /// Store a new repository record; fails if the name is taken.
    pub fn create_repository(&self, repository: &Repository) -> Result<()> {
        set_json_if(self.kv.as_ref(), REPOSITORIES, repository.name.as_str(), repository, None).map_err(|e| {
            match e {
                StorageError::AlreadyExists { .. } => Error::RepositoryExists(repository.name.to_string()),
                other => Error::Storage(other),
            }
        })?;
        info!(repository = %repository.name, namespace = %repository.storage_namespace, "created repository record");
        Ok(())
    }

    pub fn get_repository(&self, name: &RepositoryName) -> Result<Repository> {
        match get_json::<Repository>(self.kv.as_ref(), REPOSITORIES, name.as_str())? {
            Some((repository, _)) if repository.state == RepositoryState::Active => Ok(repository),
            _ => Err(Error::RepositoryNotFound(name.to_string())),
        }
    }

    /// Active repositories ordered by name, starting after `after`.
    pub fn list_repositories(&self, after: Option<&str>, limit: usize) -> Result<Vec<Repository>> {
        let all: Vec<(String, Repository)> = scan_json(self.kv.as_ref(), REPOSITORIES, "", after, self.page_size)?;
        Ok(all
            .into_iter()
            .map(|(_, repository)| repository)
            .filter(|repository| repository.state == RepositoryState::Active)
            .take(limit)
            .collect())
    }

    /// Remove a repository's refs and record.
    ///
    /// Only this repository's partition is dropped; data in the storage
    /// namespace is left for GC and other repositories are never touched.
    pub fn delete_repository(&self, name: &RepositoryName) -> Result<()> {
        let Some((mut repository, predicate)) = get_json::<Repository>(self.kv.as_ref(), REPOSITORIES, name.as_str())?
        else {
            return Err(Error::RepositoryNotFound(name.to_string()));
        };
        repository.state = RepositoryState::InDeletion;
        set_json_if(self.kv.as_ref(), REPOSITORIES, name.as_str(), &repository, Some(predicate))?;

        self.kv.delete_partition(&Self::partition(name))?;
        self.kv.delete(REPOSITORIES, name.as_str())?;
        info!(repository = %name, "deleted repository");
        Ok(())
    }

    // ==================== Branches ====================

    pub fn create_branch(&self, repository: &RepositoryName, name: &BranchName, branch: &Branch) -> Result<()> {
        set_json_if(
            self.kv.as_ref(),
            &Self::partition(repository),
            &Self::branch_key(name),
            branch,
            None,
        )
        .map_err(|e| match e {
            StorageError::AlreadyExists { .. } => Error::BranchExists {
                repository: repository.to_string(),
                branch: name.to_string(),
            },
            other => Error::Storage(other),
        })
    }

    pub fn get_branch(&self, repository: &RepositoryName, name: &BranchName) -> Result<Branch> {
        Ok(self.get_branch_with_predicate(repository, name)?.0)
    }

    /// The branch together with the predicate needed to update it.
    pub fn get_branch_with_predicate(
        &self,
        repository: &RepositoryName,
        name: &BranchName,
    ) -> Result<(Branch, Predicate)> {
        get_json(self.kv.as_ref(), &Self::partition(repository), &Self::branch_key(name))?.ok_or_else(|| {
            Error::BranchNotFound {
                repository: repository.to_string(),
                branch: name.to_string(),
            }
        })
    }

    /// Replace the branch only if it is still at `expected`.
    pub fn update_branch(
        &self,
        repository: &RepositoryName,
        name: &BranchName,
        expected: Predicate,
        branch: &Branch,
    ) -> Result<()> {
        set_json_if(
            self.kv.as_ref(),
            &Self::partition(repository),
            &Self::branch_key(name),
            branch,
            Some(expected),
        )?;
        debug!(repository = %repository, branch = %name, commit_id = %branch.commit_id, "updated branch");
        Ok(())
    }

    pub fn delete_branch(&self, repository: &RepositoryName, name: &BranchName) -> Result<Branch> {
        let branch = self.get_branch(repository, name)?;
        self.kv.delete(&Self::partition(repository), &Self::branch_key(name))?;
        Ok(branch)
    }

    /// Branches whose name starts with `prefix`, ordered by name.
    pub fn list_branches(
        &self,
        repository: &RepositoryName,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(BranchName, Branch)>> {
        let after = after.map(|a| format!("branches/{}", a));
        let found: Vec<(String, Branch)> = scan_json(
            self.kv.as_ref(),
            &Self::partition(repository),
            &format!("branches/{}", prefix),
            after.as_deref(),
            self.page_size,
        )?;
        found
            .into_iter()
            .take(limit)
            .map(|(key, branch)| Ok((BranchName::new(&key["branches/".len()..])?, branch)))
            .collect()
    }

    // ==================== Tags ====================

    pub fn create_tag(&self, repository: &RepositoryName, tag: &Tag) -> Result<()> {
        set_json_if(
            self.kv.as_ref(),
            &Self::partition(repository),
            &Self::tag_key(&tag.name),
            tag,
            None,
        )
        .map_err(|e| match e {
            StorageError::AlreadyExists { .. } => Error::TagExists {
                repository: repository.to_string(),
                tag: tag.name.to_string(),
            },
            other => Error::Storage(other),
        })?;
        info!(repository = %repository, tag = %tag.name, commit_id = %tag.commit_id, "created tag");
        Ok(())
    }

    pub fn get_tag(&self, repository: &RepositoryName, name: &TagName) -> Result<Tag> {
        get_json(self.kv.as_ref(), &Self::partition(repository), &Self::tag_key(name))?
            .map(|(tag, _)| tag)
            .ok_or_else(|| Error::TagNotFound {
                repository: repository.to_string(),
                tag: name.to_string(),
            })
    }

    pub fn delete_tag(&self, repository: &RepositoryName, name: &TagName) -> Result<()> {
        self.get_tag(repository, name)?;
        self.kv.delete(&Self::partition(repository), &Self::tag_key(name))?;
        info!(repository = %repository, tag = %name, "deleted tag");
        Ok(())
    }

    pub fn list_tags(
        &self,
        repository: &RepositoryName,
        prefix: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Tag>> {
        let after = after.map(|a| format!("tags/{}", a));
        let found: Vec<(String, Tag)> = scan_json(
            self.kv.as_ref(),
            &Self::partition(repository),
            &format!("tags/{}", prefix),
            after.as_deref(),
            self.page_size,
        )?;
        Ok(found.into_iter().take(limit).map(|(_, tag)| tag).collect())
    }

    // ==================== Settings ====================

    pub fn get_setting<T: DeserializeOwned>(&self, repository: &RepositoryName, name: &str) -> Result<Option<T>> {
        Ok(get_json(self.kv.as_ref(), &Self::partition(repository), &format!("settings/{}", name))?
            .map(|(value, _)| value))
    }

    pub fn set_setting<T: Serialize>(&self, repository: &RepositoryName, name: &str, value: &T) -> Result<()> {
        set_json(self.kv.as_ref(), &Self::partition(repository), &format!("settings/{}", name), value)?;
        Ok(())
    }

    pub fn delete_setting(&self, repository: &RepositoryName, name: &str) -> Result<()> {
        self.kv
            .delete(&Self::partition(repository), &format!("settings/{}", name))?;
        Ok(())
    }

    // ==================== Link addresses ====================

    pub fn set_link_address(&self, repository: &RepositoryName, link: &LinkAddress) -> Result<()> {
        set_json(
            self.kv.as_ref(),
            &Self::partition(repository),
            &format!("links/{}", link.address),
            link,
        )?;
        Ok(())
    }

    pub fn get_link_address(&self, repository: &RepositoryName, address: &str) -> Result<Option<LinkAddress>> {
        Ok(get_json(self.kv.as_ref(), &Self::partition(repository), &format!("links/{}", address))?
            .map(|(link, _)| link))
    }

    pub fn delete_link_address(&self, repository: &RepositoryName, address: &str) -> Result<()> {
        self.kv
            .delete(&Self::partition(repository), &format!("links/{}", address))?;
        Ok(())
    }

    pub fn list_link_addresses(&self, repository: &RepositoryName) -> Result<Vec<LinkAddress>> {
        let found: Vec<(String, LinkAddress)> = scan_json(
            self.kv.as_ref(),
            &Self::partition(repository),
            "links/",
            None,
            self.page_size,
        )?;
        Ok(found.into_iter().map(|(_, link)| link).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{content_hash, MemoryKv};

    fn refs() -> RefManager {
        RefManager::new(Arc::new(MemoryKv::new()), 2)
    }

    fn repo(name: &str) -> Repository {
        Repository {
            name: RepositoryName::new(name).unwrap(),
            storage_namespace: format!("mem://{}", name),
            default_branch: BranchName::main(),
            creation_date: Utc::now(),
            state: RepositoryState::Active,
        }
    }

    fn commit(tag: &str) -> CommitId {
        CommitId::from_hex(&content_hash(tag.as_bytes())).unwrap()
    }

    #[test]
    fn test_repository_lifecycle() {
        let refs = refs();
        refs.create_repository(&repo("alpha")).unwrap();
        refs.create_repository(&repo("alpha-two")).unwrap();
        assert!(refs.create_repository(&repo("alpha")).unwrap_err().is_conflict());

        let name = RepositoryName::new("alpha").unwrap();
        let other = RepositoryName::new("alpha-two").unwrap();
        refs.create_branch(&other, &BranchName::main(), &Branch::new(commit("c")))
            .unwrap();

        refs.delete_repository(&name).unwrap();
        assert!(refs.get_repository(&name).unwrap_err().is_not_found());
        // a shared name prefix is not affected
        assert!(refs.get_branch(&other, &BranchName::main()).is_ok());
        let names: Vec<String> = refs
            .list_repositories(None, 10)
            .unwrap()
            .into_iter()
            .map(|r| r.name.to_string())
            .collect();
        assert_eq!(names, vec!["alpha-two"]);
    }

    #[test]
    fn test_branch_compare_and_swap() {
        let refs = refs();
        let repository = RepositoryName::new("repo").unwrap();
        let main = BranchName::main();
        refs.create_branch(&repository, &main, &Branch::new(commit("c1"))).unwrap();

        let (branch, predicate) = refs.get_branch_with_predicate(&repository, &main).unwrap();
        let mut first = branch.clone();
        first.commit_id = commit("c2");
        let mut second = branch;
        second.commit_id = commit("c3");

        refs.update_branch(&repository, &main, predicate, &first).unwrap();
        let err = refs.update_branch(&repository, &main, predicate, &second).unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(refs.get_branch(&repository, &main).unwrap().commit_id, commit("c2"));
    }

    #[test]
    fn test_list_branches_and_tags() {
        let refs = refs();
        let repository = RepositoryName::new("repo").unwrap();
        for name in ["main", "feature-a", "feature-b", "fix"] {
            refs.create_branch(&repository, &BranchName::new(name).unwrap(), &Branch::new(commit(name)))
                .unwrap();
        }
        let names: Vec<String> = refs
            .list_branches(&repository, "feature", None, 10)
            .unwrap()
            .into_iter()
            .map(|(name, _)| name.to_string())
            .collect();
        assert_eq!(names, vec!["feature-a", "feature-b"]);

        let after: Vec<String> = refs
            .list_branches(&repository, "", Some("fix"), 10)
            .unwrap()
            .into_iter()
            .map(|(name, _)| name.to_string())
            .collect();
        assert_eq!(after, vec!["main"]);

        let tag = Tag {
            name: TagName::new("v1.0").unwrap(),
            commit_id: commit("main"),
        };
        refs.create_tag(&repository, &tag).unwrap();
        assert!(matches!(refs.create_tag(&repository, &tag), Err(Error::TagExists { .. })));
        assert_eq!(refs.list_tags(&repository, "", None, 10).unwrap(), vec![tag.clone()]);
        refs.delete_tag(&repository, &tag.name).unwrap();
        assert!(refs.get_tag(&repository, &tag.name).unwrap_err().is_not_found());
    }
}
