//! Commit-level mark phase of garbage collection.
//!
//! The mark decides which commits stay alive and computes everything they
//! reference. Nothing is deleted here: the result is a report that an
//! external sweep compares against the objects it finds in the namespace.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use ulid::Ulid;

use crate::cancel::CancelFlag;
use crate::committed::MetaRangeManager;
use crate::error::{Error, Result};
use crate::gc::rules::GarbageCollectionRules;
use crate::graph::{CommitGraph, CommitRecord};
use crate::storage::{AddressType, BlobStore, BranchName, CommitId, MetaRangeId, RangeId, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcRunState {
    NotStarted,
    Running,
    Completed,
    Failed,
}

/// A persisted mark run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcRun {
    pub run_id: String,
    pub state: GcRunState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GcRun {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            run_id: Ulid::new().to_string(),
            state: GcRunState::NotStarted,
            created_at: now,
            updated_at: now,
            report_location: None,
            error: None,
        }
    }

    /// Enter `Running`. Failed and interrupted runs may start again.
    pub fn start(&mut self) -> Result<()> {
        if self.state == GcRunState::Completed {
            return Err(Error::InvalidValue(format!("gc run {} already completed", self.run_id)));
        }
        self.transition(GcRunState::Running);
        self.error = None;
        Ok(())
    }

    pub fn complete(&mut self, report_location: String) -> Result<()> {
        if self.state != GcRunState::Running {
            return Err(Error::InvalidValue(format!(
                "gc run {} cannot complete from {:?}",
                self.run_id, self.state
            )));
        }
        self.transition(GcRunState::Completed);
        self.report_location = Some(report_location);
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.transition(GcRunState::Failed);
        self.error = Some(reason.into());
    }

    fn transition(&mut self, state: GcRunState) {
        info!(run_id = %self.run_id, from = ?self.state, to = ?state, "gc run transition");
        self.state = state;
        self.updated_at = Utc::now();
    }
}

impl Default for GcRun {
    fn default() -> Self {
        Self::new()
    }
}

/// Commits split into retained and expired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitMark {
    pub retained: BTreeSet<CommitId>,
    pub expired: BTreeSet<CommitId>,
}

/// Everything reachable from the retained commits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Closure {
    pub metarange_ids: BTreeSet<MetaRangeId>,
    pub range_ids: BTreeSet<RangeId>,
    /// relative addresses only; full addresses live outside the namespace
    pub physical_addresses: BTreeSet<String>,
}

/// The output of a mark run, stored as a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    pub run_id: String,
    pub created_at: DateTime<Utc>,
    pub retained_commits: BTreeSet<CommitId>,
    pub expired_commits: BTreeSet<CommitId>,
    #[serde(flatten)]
    pub closure: Closure,
}

struct CommitCache<'a> {
    graph: &'a dyn CommitGraph,
    namespace: &'a str,
    loaded: HashMap<CommitId, CommitRecord>,
}

impl<'a> CommitCache<'a> {
    fn get(&mut self, id: &CommitId) -> Result<&CommitRecord> {
        if !self.loaded.contains_key(id) {
            let record = self.graph.get_commit(self.namespace, id)?;
            self.loaded.insert(id.clone(), record);
        }
        self.loaded
            .get(id)
            .ok_or_else(|| Error::CommitNotFound(id.to_string()))
    }

    fn parents(&mut self, id: &CommitId) -> Result<Vec<CommitId>> {
        Ok(self.get(id)?.commit.parents.clone())
    }
}

fn window_start(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    now - Duration::days(i64::from(days))
}

/// Split every commit of `namespace` into retained and expired.
///
/// - branch HEADs and tagged commits are retained
/// - a commit reachable from a HEAD is retained while every commit on the
///   path from the HEAD is younger than that branch's window
/// - a commit no branch reaches is retained while younger than the default
///   window
pub fn mark_commits(
    graph: &dyn CommitGraph,
    namespace: &str,
    heads: &[(BranchName, CommitId)],
    tagged: &[CommitId],
    rules: &GarbageCollectionRules,
    now: DateTime<Utc>,
    cancel: &CancelFlag,
) -> Result<CommitMark> {
    let mut cache = CommitCache {
        graph,
        namespace,
        loaded: HashMap::new(),
    };
    let mut retained = BTreeSet::new();
    let mut reachable = HashSet::new();

    for (branch, head) in heads {
        let threshold = window_start(now, rules.retention_days(branch));
        retained.insert(head.clone());

        let mut visited = HashSet::new();
        let mut stack = vec![head.clone()];
        while let Some(id) = stack.pop() {
            cancel.check()?;
            if !visited.insert(id.clone()) {
                continue;
            }
            for parent in cache.parents(&id)? {
                if cache.get(&parent)?.commit.creation_date >= threshold {
                    retained.insert(parent.clone());
                    stack.push(parent);
                }
            }
        }

        let mut stack = vec![head.clone()];
        while let Some(id) = stack.pop() {
            cancel.check()?;
            if reachable.insert(id.clone()) {
                stack.extend(cache.parents(&id)?);
            }
        }
    }
    retained.extend(tagged.iter().cloned());

    let default_threshold = window_start(now, rules.default_retention_days);
    let mut expired = BTreeSet::new();
    for id in graph.list_commits(namespace)? {
        cancel.check()?;
        if retained.contains(&id) {
            continue;
        }
        let dangling = !reachable.contains(&id);
        if dangling && cache.get(&id)?.commit.creation_date >= default_threshold {
            retained.insert(id);
        } else {
            expired.insert(id);
        }
    }

    debug!(retained = retained.len(), expired = expired.len(), "marked commits");
    Ok(CommitMark { retained, expired })
}

/// Collect the metaranges, ranges and addresses the retained commits use.
pub fn compute_closure<'a>(
    graph: &dyn CommitGraph,
    metaranges: &MetaRangeManager,
    namespace: &str,
    retained: impl IntoIterator<Item = &'a CommitId>,
    cancel: &CancelFlag,
) -> Result<Closure> {
    let mut closure = Closure::default();
    for id in retained {
        cancel.check()?;
        let metarange_id = graph.get_commit(namespace, id)?.commit.metarange_id;
        if !closure.metarange_ids.insert(metarange_id.clone()) {
            continue;
        }
        for descriptor in metaranges.read_metarange(namespace, &metarange_id)? {
            if !closure.range_ids.insert(descriptor.id.clone()) {
                continue;
            }
            cancel.check()?;
            for record in metaranges.ranges().read_range(namespace, &descriptor.id)? {
                if record.entry.address_type == AddressType::Relative {
                    closure.physical_addresses.insert(record.entry.physical_address);
                }
            }
        }
    }
    Ok(closure)
}

fn report_key(prefix: &str, run_id: &str) -> String {
    format!("{}/gc/reports/{}.json", prefix, run_id)
}

/// Store `report` and return its location inside the namespace.
pub fn write_report(store: &dyn BlobStore, namespace: &str, prefix: &str, report: &GcReport) -> Result<String> {
    let key = report_key(prefix, &report.run_id);
    store.put(namespace, &key, &serde_json::to_vec(report)?)?;
    Ok(key)
}

pub fn read_report(store: &dyn BlobStore, namespace: &str, location: &str) -> Result<GcReport> {
    let bytes = store.get(namespace, location).map_err(|e| match e {
        StorageError::BlobNotFound { .. } => Error::InvalidValue(format!("gc report not found: {}", location)),
        other => Error::Storage(other),
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}
