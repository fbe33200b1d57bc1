//! Sweep helper for external tooling.
//!
//! The engine never deletes data objects itself. A sweeper lists the objects
//! of a namespace through [`PhysicalObjectStore`] and removes the ones no
//! report keeps alive.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cancel::CancelFlag;
use crate::error::Result;

/// An object found in the underlying store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalObject {
    /// address relative to the namespace
    pub address: String,
    pub last_modified: DateTime<Utc>,
}

/// The physical side of a storage namespace.
pub trait PhysicalObjectStore: Send + Sync {
    fn list(&self, namespace: &str) -> Result<Vec<PhysicalObject>>;

    fn delete(&self, namespace: &str, address: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub deleted: Vec<String>,
    /// unreferenced but inside the grace period
    pub skipped_recent: usize,
    /// (address, error) for every delete that failed
    pub failed: Vec<(String, String)>,
}

/// Delete objects that are in neither `keep` set and older than `grace`.
///
/// Failed deletes are logged and collected; they never stop the sweep.
pub fn sweep(
    store: &dyn PhysicalObjectStore,
    namespace: &str,
    keep: &[&BTreeSet<String>],
    grace: Duration,
    now: DateTime<Utc>,
    cancel: &CancelFlag,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    for object in store.list(namespace)? {
        cancel.check()?;
        if keep.iter().any(|set| set.contains(&object.address)) {
            continue;
        }
        if now - object.last_modified < grace {
            report.skipped_recent += 1;
            continue;
        }
        match store.delete(namespace, &object.address) {
            Ok(()) => report.deleted.push(object.address),
            Err(e) => {
                warn!(namespace, address = %object.address, error = %e, "failed to delete object");
                report.failed.push((object.address, e.to_string()));
            }
        }
    }
    info!(
        namespace,
        deleted = report.deleted.len(),
        skipped = report.skipped_recent,
        failed = report.failed.len(),
        "sweep finished"
    );
    Ok(report)
}
