//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::committed::RangeConfig;
use crate::error::{Error, Result};

/// Engine configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Range split targets.
    pub range: RangeConfig,
    /// Attempts at a branch compare-and-swap before giving up.
    pub branch_update_max_tries: usize,
    /// How long an issued physical address may be linked, in seconds.
    pub link_address_expiry_secs: u64,
    /// Page size for staging, ref and GC scans.
    pub scan_batch_size: usize,
    /// Objects younger than this are never swept, in seconds.
    pub gc_grace_period_secs: u64,
    /// Key prefix of engine metadata inside a storage namespace.
    pub metadata_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            range: RangeConfig::default(),
            branch_update_max_tries: 10,
            link_address_expiry_secs: 6 * 60 * 60,
            scan_batch_size: 1000,
            gc_grace_period_secs: 6 * 60 * 60,
            metadata_prefix: "_data".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from JSON; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn range(mut self, range: RangeConfig) -> Self {
        self.range = range;
        self
    }

    pub fn branch_update_max_tries(mut self, tries: usize) -> Self {
        self.branch_update_max_tries = tries;
        self
    }

    pub fn link_address_expiry_secs(mut self, secs: u64) -> Self {
        self.link_address_expiry_secs = secs;
        self
    }

    pub fn scan_batch_size(mut self, size: usize) -> Self {
        self.scan_batch_size = size;
        self
    }

    pub fn gc_grace_period_secs(mut self, secs: u64) -> Self {
        self.gc_grace_period_secs = secs;
        self
    }

    pub fn metadata_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.metadata_prefix = prefix.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.branch_update_max_tries == 0 {
            return Err(Error::InvalidValue("branch_update_max_tries must be positive".into()));
        }
        if self.scan_batch_size == 0 {
            return Err(Error::InvalidValue("scan_batch_size must be positive".into()));
        }
        if self.range.target_entries == 0 || self.range.target_bytes == 0 {
            return Err(Error::InvalidValue("range targets must be positive".into()));
        }
        if self.metadata_prefix.is_empty() || self.metadata_prefix.ends_with('/') {
            return Err(Error::InvalidValue(format!(
                "invalid metadata prefix: {:?}",
                self.metadata_prefix
            )));
        }
        Ok(())
    }

    pub(crate) fn link_address_expiry(&self) -> chrono::Duration {
        seconds(self.link_address_expiry_secs)
    }

    pub(crate) fn gc_grace_period(&self) -> chrono::Duration {
        seconds(self.gc_grace_period_secs)
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_json_partial() {
        let config = EngineConfig::from_json(r#"{"branch_update_max_tries": 3, "range": {"target_entries": 50}}"#).unwrap();
        assert_eq!(config.branch_update_max_tries, 3);
        assert_eq!(config.range.target_entries, 50);
        assert_eq!(config.range.target_bytes, RangeConfig::default().target_bytes);
        assert_eq!(config.metadata_prefix, "_data");
    }

    #[test]
    fn test_validation() {
        assert!(EngineConfig::new().validate().is_ok());
        assert!(EngineConfig::new().branch_update_max_tries(0).validate().is_err());
        assert!(EngineConfig::new().metadata_prefix("meta/").validate().is_err());
        assert!(EngineConfig::from_json(r#"{"scan_batch_size": 0}"#).is_err());
    }
}
