//! References: repositories, branches and tags, and the ref expressions
//! that name commits.

mod manager;
mod resolve;

pub use manager::{Branch, LinkAddress, RefManager, Repository, RepositoryState, Tag};
pub use resolve::{RefExpression, RefModifier, ResolvedRef, ResolvedRefType, Resolver, MIN_COMMIT_PREFIX_LEN};
