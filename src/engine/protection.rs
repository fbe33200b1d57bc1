//! Branch protection rules.
//!
//! A rule names branches with a pattern where `*` matches any run of
//! characters, and lists what is blocked on them.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::storage::{BranchName, RepositoryName};

const SETTING: &str = "branch_protection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectedAction {
    /// staging, deleting or resetting entries
    StagingWrite,
    Commit,
    /// deleting the branch itself
    Delete,
}

impl ProtectedAction {
    fn as_str(self) -> &'static str {
        match self {
            ProtectedAction::StagingWrite => "staging write",
            ProtectedAction::Commit => "commit",
            ProtectedAction::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionRule {
    pub pattern: String,
    pub blocked: Vec<ProtectedAction>,
}

impl ProtectionRule {
    /// block staging writes and commits on branches matching `pattern`
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            blocked: vec![ProtectedAction::StagingWrite, ProtectedAction::Commit],
        }
    }

    pub fn blocks(&self, branch: &str, action: ProtectedAction) -> bool {
        self.blocked.contains(&action) && glob_match(&self.pattern, branch)
    }
}

/// `*` matches any (possibly empty) sequence; everything else is literal.
fn glob_match(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return text.is_empty();
    };
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };
    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        // no '*' at all
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

impl Engine {
    pub fn get_branch_protection_rules(&self, repository: &RepositoryName) -> Result<Vec<ProtectionRule>> {
        self.repository(repository)?;
        Ok(self
            .inner
            .refs
            .get_setting::<Vec<ProtectionRule>>(repository, SETTING)?
            .unwrap_or_default())
    }

    pub fn set_branch_protection_rules(&self, repository: &RepositoryName, rules: &[ProtectionRule]) -> Result<()> {
        self.repository(repository)?;
        if let Some(rule) = rules.iter().find(|r| r.pattern.is_empty()) {
            return Err(Error::InvalidValue(format!("empty protection pattern in {:?}", rule)));
        }
        self.inner.refs.set_setting(repository, SETTING, &rules)?;
        info!(repository = %repository, rules = rules.len(), "updated branch protection rules");
        Ok(())
    }

    /// `ProtectedBranch` if any rule blocks `action` on `branch`.
    pub(crate) fn check_protection(
        &self,
        repository: &RepositoryName,
        branch: &BranchName,
        action: ProtectedAction,
    ) -> Result<()> {
        let rules: Vec<ProtectionRule> = self.inner.refs.get_setting(repository, SETTING)?.unwrap_or_default();
        if rules.iter().any(|rule| rule.blocks(branch.as_str(), action)) {
            return Err(Error::ProtectedBranch {
                branch: branch.to_string(),
                action: action.as_str().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("main", "main"));
        assert!(!glob_match("main", "main2"));
        assert!(glob_match("release-*", "release-1.0"));
        assert!(glob_match("release-*", "release-"));
        assert!(!glob_match("release-*", "dev"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXcYYb"));
        assert!(glob_match("*-prod", "eu-prod"));
        assert!(!glob_match("ab*ba", "aba"));
    }

    #[test]
    fn test_rule_blocks_listed_actions_only() {
        let rule = ProtectionRule::new("main");
        assert!(rule.blocks("main", ProtectedAction::Commit));
        assert!(rule.blocks("main", ProtectedAction::StagingWrite));
        assert!(!rule.blocks("main", ProtectedAction::Delete));
        assert!(!rule.blocks("dev", ProtectedAction::Commit));
    }
}
