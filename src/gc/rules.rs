//! Retention rules.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::BranchName;

/// Per-branch retention override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRetention {
    pub branch_id: BranchName,
    pub retention_days: u32,
}

/// How long commits stay retained after they stop being a branch HEAD.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GarbageCollectionRules {
    pub default_retention_days: u32,
    #[serde(default)]
    pub branches: Vec<BranchRetention>,
}

impl Default for GarbageCollectionRules {
    fn default() -> Self {
        Self {
            default_retention_days: 21,
            branches: Vec::new(),
        }
    }
}

impl GarbageCollectionRules {
    pub fn new(default_retention_days: u32) -> Self {
        Self {
            default_retention_days,
            branches: Vec::new(),
        }
    }

    pub fn with_branch(mut self, branch: BranchName, retention_days: u32) -> Self {
        self.branches.retain(|b| b.branch_id != branch);
        self.branches.push(BranchRetention {
            branch_id: branch,
            retention_days,
        });
        self
    }

    /// retention of `branch`, falling back to the default
    pub fn retention_days(&self, branch: &BranchName) -> u32 {
        self.branches
            .iter()
            .find(|b| &b.branch_id == branch)
            .map_or(self.default_retention_days, |b| b.retention_days)
    }

    pub fn validate(&self) -> Result<()> {
        for (i, rule) in self.branches.iter().enumerate() {
            if self.branches[..i].iter().any(|other| other.branch_id == rule.branch_id) {
                return Err(Error::InvalidValue(format!(
                    "duplicate retention rule for branch {}",
                    rule.branch_id
                )));
            }
        }
        Ok(())
    }
}
