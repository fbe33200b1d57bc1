//! Branches, tags, ref resolution and commit lookup.

use tracing::{info, warn};

use crate::engine::protection::ProtectedAction;
use crate::engine::retry::retry_branch_update;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::graph::{CommitGraph, CommitRecord};
use crate::refs::{Branch, ResolvedRef, Tag};
use crate::storage::{BranchName, CommitId, RepositoryName, StagingToken, TagName};

impl Engine {
    /// Resolve a ref expression (branch, tag, commit id, with `~N`, `^N`, `@`).
    pub fn resolve_ref(&self, repository: &RepositoryName, expr: &str) -> Result<ResolvedRef> {
        let repo = self.repository(repository)?;
        self.inner.resolver.resolve(&repo, expr)
    }

    pub fn get_commit(&self, repository: &RepositoryName, commit_id: &CommitId) -> Result<CommitRecord> {
        let repo = self.repository(repository)?;
        self.inner.commits.get_commit(&repo.storage_namespace, commit_id)
    }

    // ==================== Branches ====================

    /// Create `name` at the commit `source` resolves to; staged changes of a
    /// source branch are not carried over.
    pub fn create_branch(&self, repository: &RepositoryName, name: &BranchName, source: &str) -> Result<Branch> {
        let repo = self.repository(repository)?;
        let resolved = self.inner.resolver.resolve(&repo, source)?;
        let branch = Branch::new(resolved.commit_id);
        self.inner.refs.create_branch(repository, name, &branch)?;
        info!(repository = %repository, branch = %name, commit_id = %branch.commit_id, "created branch");
        Ok(branch)
    }

    pub fn get_branch(&self, repository: &RepositoryName, name: &BranchName) -> Result<Branch> {
        self.repository(repository)?;
        self.inner.refs.get_branch(repository, name)
    }

    pub fn list_branches(
        &self,
        repository: &RepositoryName,
        prefix: &str,
        after: Option<&BranchName>,
        limit: usize,
    ) -> Result<Vec<(BranchName, Branch)>> {
        self.repository(repository)?;
        self.inner
            .refs
            .list_branches(repository, prefix, after.map(BranchName::as_str), limit)
    }

    /// Delete a branch and discard its staged changes.
    pub fn delete_branch(&self, repository: &RepositoryName, name: &BranchName) -> Result<()> {
        let repo = self.repository(repository)?;
        if &repo.default_branch == name {
            return Err(Error::ProtectedBranch {
                branch: name.to_string(),
                action: "delete default branch".to_string(),
            });
        }
        self.check_protection(repository, name, ProtectedAction::Delete)?;
        let branch = self.inner.refs.delete_branch(repository, name)?;
        self.drop_tokens(repository, name, &branch.staging_tokens());
        info!(repository = %repository, branch = %name, "deleted branch");
        Ok(())
    }

    /// Discard every uncommitted change on the branch.
    pub fn reset_branch(&self, repository: &RepositoryName, name: &BranchName) -> Result<()> {
        self.repository(repository)?;
        self.check_protection(repository, name, ProtectedAction::StagingWrite)?;
        let max_tries = self.inner.config.branch_update_max_tries;
        let dropped = retry_branch_update(name, max_tries, |_| {
            let (branch, predicate) = self.inner.refs.get_branch_with_predicate(repository, name)?;
            let reset = Branch::new(branch.commit_id.clone());
            self.inner.refs.update_branch(repository, name, predicate, &reset)?;
            Ok(branch.staging_tokens())
        })?;
        self.drop_tokens(repository, name, &dropped);
        info!(repository = %repository, branch = %name, "reset branch");
        Ok(())
    }

    /// Point the branch at another staging token.
    ///
    /// Administrative: the previous token is neither dropped nor merged.
    /// HEAD and sealed tokens are kept even if a commit moves the branch
    /// concurrently.
    pub fn update_branch_token(
        &self,
        repository: &RepositoryName,
        name: &BranchName,
        token: StagingToken,
    ) -> Result<Branch> {
        self.repository(repository)?;
        let max_tries = self.inner.config.branch_update_max_tries;
        let branch = retry_branch_update(name, max_tries, |_| {
            let (current, predicate) = self.inner.refs.get_branch_with_predicate(repository, name)?;
            let next = Branch {
                staging_token: token.clone(),
                ..current
            };
            self.inner.refs.update_branch(repository, name, predicate, &next)?;
            Ok(next)
        })?;
        info!(repository = %repository, branch = %name, token = %branch.staging_token, "replaced staging token");
        Ok(branch)
    }

    pub(crate) fn drop_tokens(&self, repository: &RepositoryName, branch: &BranchName, tokens: &[StagingToken]) {
        for token in tokens {
            if let Err(e) = self.inner.staging.drop_token(token) {
                warn!(repository = %repository, branch = %branch, token = %token, error = %e, "failed to drop staging token");
            }
        }
    }

    // ==================== Tags ====================

    pub fn create_tag(&self, repository: &RepositoryName, name: &TagName, target: &str) -> Result<Tag> {
        let repo = self.repository(repository)?;
        let resolved = self.inner.resolver.resolve(&repo, target)?;
        let tag = Tag {
            name: name.clone(),
            commit_id: resolved.commit_id,
        };
        self.inner.refs.create_tag(repository, &tag)?;
        Ok(tag)
    }

    pub fn get_tag(&self, repository: &RepositoryName, name: &TagName) -> Result<Tag> {
        self.repository(repository)?;
        self.inner.refs.get_tag(repository, name)
    }

    pub fn list_tags(
        &self,
        repository: &RepositoryName,
        prefix: &str,
        after: Option<&TagName>,
        limit: usize,
    ) -> Result<Vec<Tag>> {
        self.repository(repository)?;
        self.inner
            .refs
            .list_tags(repository, prefix, after.map(TagName::as_str), limit)
    }

    pub fn delete_tag(&self, repository: &RepositoryName, name: &TagName) -> Result<()> {
        self.repository(repository)?;
        self.inner.refs.delete_tag(repository, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CommitParams, ProtectionRule};
    use crate::refs::ResolvedRefType;
    use crate::storage::{Entry, Key};

    fn setup() -> (Engine, RepositoryName) {
        let engine = Engine::in_memory();
        let repo = RepositoryName::new("repo").unwrap();
        engine
            .create_repository(&repo, "mem://repo", &BranchName::main())
            .unwrap();
        (engine, repo)
    }

    fn stage(engine: &Engine, repo: &RepositoryName, branch: &BranchName, key: &str) {
        engine
            .stage_entry(repo, branch, &Key::new(key).unwrap(), Entry::new(format!("data/{}", key), 1, "c"))
            .unwrap();
    }

    #[test]
    fn test_branch_from_branch_ignores_staging() {
        let (engine, repo) = setup();
        let main = BranchName::main();
        stage(&engine, &repo, &main, "a");
        let dev = BranchName::new("dev").unwrap();
        let branch = engine.create_branch(&repo, &dev, "main").unwrap();
        assert_eq!(branch.commit_id, engine.get_branch(&repo, &main).unwrap().commit_id);
        assert!(engine.get_entry(&repo, "dev", "a").unwrap_err().is_not_found());
        assert!(engine.create_branch(&repo, &dev, "main").unwrap_err().is_conflict());
    }

    #[test]
    fn test_delete_branch_rules() {
        let (engine, repo) = setup();
        let main = BranchName::main();
        assert!(matches!(
            engine.delete_branch(&repo, &main),
            Err(Error::ProtectedBranch { .. })
        ));
        let dev = BranchName::new("dev").unwrap();
        engine.create_branch(&repo, &dev, "main").unwrap();
        stage(&engine, &repo, &dev, "x");
        let token = engine.get_branch(&repo, &dev).unwrap().staging_token;
        engine.delete_branch(&repo, &dev).unwrap();
        assert!(engine.get_branch(&repo, &dev).unwrap_err().is_not_found());
        assert!(engine.staging().is_empty(&token).unwrap());
    }

    #[test]
    fn test_reset_branch_drops_staging() {
        let (engine, repo) = setup();
        let main = BranchName::main();
        stage(&engine, &repo, &main, "a");
        engine.reset_branch(&repo, &main).unwrap();
        assert!(engine.get_entry(&repo, "main", "a").unwrap_err().is_not_found());
    }

    #[test]
    fn test_update_branch_token_keeps_head_and_sealed() {
        let (engine, repo) = setup();
        let main = BranchName::main();
        stage(&engine, &repo, &main, "a");
        let head = engine.commit(&repo, &main, CommitParams::new("c1")).unwrap();

        // leave a sealed token behind, as an in-flight commit would
        let sealed = StagingToken::generate();
        let (current, predicate) = engine.inner.refs.get_branch_with_predicate(&repo, &main).unwrap();
        let in_flight = Branch {
            sealed_tokens: vec![sealed.clone()],
            ..current
        };
        engine.inner.refs.update_branch(&repo, &main, predicate, &in_flight).unwrap();

        let token = StagingToken::new("bulk-import").unwrap();
        let updated = engine.update_branch_token(&repo, &main, token.clone()).unwrap();
        assert_eq!(updated.staging_token, token);
        assert_eq!(updated.commit_id, head.id);
        assert_eq!(updated.sealed_tokens, vec![sealed]);
        assert_eq!(engine.get_branch(&repo, &main).unwrap(), updated);
    }

    #[test]
    fn test_protected_branch_blocks_writes_and_commits() {
        let (engine, repo) = setup();
        let main = BranchName::main();
        engine
            .set_branch_protection_rules(&repo, &[ProtectionRule::new("ma*")])
            .unwrap();
        let err = engine
            .stage_entry(&repo, &main, &Key::new("a").unwrap(), Entry::new("data/a", 1, "c"))
            .unwrap_err();
        assert!(matches!(err, Error::ProtectedBranch { .. }));
        let err = engine
            .commit(&repo, &main, CommitParams::new("m").allow_empty(true))
            .unwrap_err();
        assert!(matches!(err, Error::ProtectedBranch { .. }));
        assert_eq!(engine.get_branch_protection_rules(&repo).unwrap().len(), 1);
    }

    #[test]
    fn test_tags_and_resolution() {
        let (engine, repo) = setup();
        let main = BranchName::main();
        stage(&engine, &repo, &main, "a");
        let first = engine.commit(&repo, &main, CommitParams::new("first")).unwrap();
        let v1 = TagName::new("v1").unwrap();
        let tag = engine.create_tag(&repo, &v1, "main").unwrap();
        assert_eq!(tag.commit_id, first.id);

        stage(&engine, &repo, &main, "b");
        engine.commit(&repo, &main, CommitParams::new("second")).unwrap();

        let resolved = engine.resolve_ref(&repo, "v1").unwrap();
        assert_eq!(resolved.ref_type, ResolvedRefType::Tag);
        assert_eq!(resolved.commit_id, first.id);
        assert_eq!(engine.resolve_ref(&repo, "main~1").unwrap().commit_id, first.id);
        assert_eq!(engine.list_tags(&repo, "", None, 10).unwrap(), vec![tag]);

        engine.delete_tag(&repo, &v1).unwrap();
        assert!(engine.get_tag(&repo, &v1).unwrap_err().is_not_found());
    }
}
