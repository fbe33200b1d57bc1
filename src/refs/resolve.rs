//! Ref expressions.
//!
//! A ref is a branch, a tag or a (possibly abbreviated) commit id, followed
//! by optional modifiers:
//! - `@` directly after a branch: its committed state only, ignoring staging
//! - `~N`: the Nth first-parent ancestor (`~` alone means `~1`)
//! - `^N`: the Nth parent (`^` alone means `^1`)
//!
//! Modifiers chain left to right: `main~2^2` is the second parent of the
//! grandparent of `main`.

use crate::error::{Error, Result};
use crate::graph::{CommitGraph, CommitManager};
use crate::refs::manager::{RefManager, Repository};
use crate::storage::{BranchName, CommitId, StagingToken, TagName, HASH_HEX_LEN};

/// shortest accepted commit id abbreviation
pub const MIN_COMMIT_PREFIX_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefModifier {
    /// `@`
    Committed,
    /// `~N`
    Ancestor(u32),
    /// `^N`
    Parent(u32),
}

/// A parsed ref expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefExpression {
    pub base: String,
    pub modifiers: Vec<RefModifier>,
}

impl RefExpression {
    pub fn parse(expr: &str) -> Result<Self> {
        let invalid = || Error::InvalidRef(expr.to_string());
        let split = expr.find(['~', '^', '@']).unwrap_or(expr.len());
        let (base, mut rest) = expr.split_at(split);
        if base.is_empty() {
            return Err(invalid());
        }

        let mut modifiers = Vec::new();
        if let Some(after) = rest.strip_prefix('@') {
            modifiers.push(RefModifier::Committed);
            rest = after;
        }
        while let Some(op) = rest.chars().next() {
            let modifier: fn(u32) -> RefModifier = match op {
                '~' => RefModifier::Ancestor,
                '^' => RefModifier::Parent,
                _ => return Err(invalid()),
            };
            let digits: String = rest[1..].chars().take_while(char::is_ascii_digit).collect();
            let n = if digits.is_empty() {
                1
            } else {
                digits.parse::<u32>().map_err(|_| invalid())?
            };
            modifiers.push(modifier(n));
            rest = &rest[1 + digits.len()..];
        }
        Ok(Self {
            base: base.to_string(),
            modifiers,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedRefType {
    Branch,
    Tag,
    Commit,
}

/// What a ref expression points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRef {
    pub ref_type: ResolvedRefType,
    pub commit_id: CommitId,
    /// set when the ref names a branch
    pub branch: Option<BranchName>,
    /// staging tokens to read through, newest first; empty for committed-only reads
    pub staging_tokens: Vec<StagingToken>,
}

impl ResolvedRef {
    pub fn includes_staging(&self) -> bool {
        !self.staging_tokens.is_empty()
    }
}

/// Resolves ref expressions against a repository's refs and commits.
#[derive(Clone)]
pub struct Resolver {
    refs: RefManager,
    commits: CommitManager,
}

impl Resolver {
    pub fn new(refs: RefManager, commits: CommitManager) -> Self {
        Self { refs, commits }
    }

    pub fn resolve(&self, repository: &Repository, expr: &str) -> Result<ResolvedRef> {
        let parsed = RefExpression::parse(expr)?;
        let mut resolved = self.resolve_base(repository, &parsed.base)?;
        let namespace = &repository.storage_namespace;

        for modifier in parsed.modifiers {
            match modifier {
                RefModifier::Committed => {
                    if resolved.ref_type != ResolvedRefType::Branch {
                        return Err(Error::InvalidRef(format!("{}: '@' applies only to branches", expr)));
                    }
                    resolved.staging_tokens.clear();
                }
                RefModifier::Ancestor(n) => {
                    for _ in 0..n {
                        let commit = self.commits.get_commit(namespace, &resolved.commit_id)?;
                        resolved.commit_id = commit
                            .first_parent()
                            .cloned()
                            .ok_or_else(|| Error::RefNotFound(expr.to_string()))?;
                    }
                    resolved = Self::detach(resolved);
                }
                RefModifier::Parent(n) => {
                    if n > 0 {
                        let commit = self.commits.get_commit(namespace, &resolved.commit_id)?;
                        resolved.commit_id = commit
                            .commit
                            .parents
                            .get(n as usize - 1)
                            .cloned()
                            .ok_or_else(|| Error::RefNotFound(expr.to_string()))?;
                    }
                    resolved = Self::detach(resolved);
                }
            }
        }
        Ok(resolved)
    }

    fn detach(resolved: ResolvedRef) -> ResolvedRef {
        ResolvedRef {
            ref_type: ResolvedRefType::Commit,
            commit_id: resolved.commit_id,
            branch: None,
            staging_tokens: Vec::new(),
        }
    }

    fn resolve_base(&self, repository: &Repository, base: &str) -> Result<ResolvedRef> {
        if let Ok(name) = BranchName::new(base) {
            match self.refs.get_branch(&repository.name, &name) {
                Ok(branch) => {
                    return Ok(ResolvedRef {
                        ref_type: ResolvedRefType::Branch,
                        commit_id: branch.commit_id.clone(),
                        staging_tokens: branch.staging_tokens(),
                        branch: Some(name),
                    })
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        if let Ok(name) = TagName::new(base) {
            match self.refs.get_tag(&repository.name, &name) {
                Ok(tag) => {
                    return Ok(ResolvedRef {
                        ref_type: ResolvedRefType::Tag,
                        commit_id: tag.commit_id,
                        branch: None,
                        staging_tokens: Vec::new(),
                    })
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        if base.len() >= MIN_COMMIT_PREFIX_LEN && CommitId::is_prefix_candidate(base) {
            let namespace = &repository.storage_namespace;
            let commit_id = if base.len() == HASH_HEX_LEN {
                let id = CommitId::from_hex(base)?;
                self.commits.get_commit(namespace, &id)?.id
            } else {
                self.commits.find_by_prefix(namespace, base)?
            };
            return Ok(ResolvedRef {
                ref_type: ResolvedRefType::Commit,
                commit_id,
                branch: None,
                staging_tokens: Vec::new(),
            });
        }

        Err(Error::RefNotFound(base.to_string()))
    }
}
