//! Uncommitted garbage collection.
//!
//! Objects uploaded and staged but never committed are invisible to the
//! commit mark. This scan walks every branch's staging tokens and reports the
//! addresses still referenced from staging, so a sweep can tell them apart
//! from abandoned uploads. Large repositories are scanned in pages; each page
//! hands back an opaque mark to continue from.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use ulid::Ulid;

use crate::cancel::CancelFlag;
use crate::committed::{MetaRangeManager, RecordIterator};
use crate::error::{Error, Result};
use crate::graph::CommitGraph;
use crate::refs::{RefManager, Repository};
use crate::staging::{ChangeIterator, StagingManager};
use crate::storage::{AddressType, BlobStore};

/// Where a paginated scan stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ScanMark {
    run_id: String,
    page: u32,
    branch: String,
    token: String,
    /// last staged key already processed
    after: String,
}

impl ScanMark {
    fn encode(&self) -> Result<String> {
        Ok(hex::encode(serde_json::to_vec(self)?))
    }

    fn decode(mark: &str) -> Result<Self> {
        let invalid = || Error::InvalidValue(format!("invalid continuation mark: {}", mark));
        let bytes = hex::decode(mark).map_err(|_| invalid())?;
        serde_json::from_slice(&bytes).map_err(|_| invalid())
    }
}

/// One page of an uncommitted GC scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UncommittedGcPage {
    pub run_id: String,
    pub page: u32,
    /// addresses referenced by staged entries and not by the branch HEAD,
    /// plus link addresses still inside their expiry
    pub addresses: BTreeSet<String>,
    /// blob key of this page's report
    pub location: String,
    /// pass back to continue; `None` on the last page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation: Option<String>,
}

/// Scans staging areas for uncommitted object references.
pub struct UncommittedScanner<'a> {
    pub refs: &'a RefManager,
    pub staging: &'a StagingManager,
    pub commits: &'a dyn CommitGraph,
    pub metaranges: &'a MetaRangeManager,
    pub store: Arc<dyn BlobStore>,
    pub prefix: &'a str,
    /// addresses per page
    pub page_size: usize,
}

impl UncommittedScanner<'_> {
    /// Produce the next page of the scan; `mark` is `None` to start a new run.
    pub fn scan(
        &self,
        repository: &Repository,
        mark: Option<&str>,
        link_expiry: Duration,
        now: DateTime<Utc>,
        cancel: &CancelFlag,
    ) -> Result<UncommittedGcPage> {
        let resume = mark.map(ScanMark::decode).transpose()?;
        let run_id = resume
            .as_ref()
            .map_or_else(|| Ulid::new().to_string(), |m| m.run_id.clone());
        let page = resume.as_ref().map_or(0, |m| m.page + 1);
        let namespace = repository.storage_namespace.as_str();
        let limit = self.page_size.max(1);

        let mut addresses = BTreeSet::new();
        if resume.is_none() {
            for link in self.refs.list_link_addresses(&repository.name)? {
                if now - link.issued_at < link_expiry {
                    addresses.insert(link.address);
                }
            }
        }

        let mut continuation = None;
        let branches = self.refs.list_branches(&repository.name, "", None, usize::MAX)?;
        'branches: for (name, branch) in branches {
            if resume.as_ref().is_some_and(|m| name.as_str() < m.branch.as_str()) {
                continue;
            }
            let tokens = branch.staging_tokens();
            let mut first_token = 0;
            let mut start_after: Option<String> = None;
            if let Some(m) = resume.as_ref().filter(|m| m.branch == name.as_str()) {
                if let Some(pos) = tokens.iter().position(|t| t.as_str() == m.token) {
                    first_token = pos;
                    start_after = Some(m.after.clone());
                }
            }

            let head = self.commits.get_commit(namespace, &branch.commit_id)?;
            for token in &tokens[first_token..] {
                let mut committed = self.metaranges.entries(namespace, &head.commit.metarange_id)?;
                let mut staged = self.staging.changes(token);
                if let Some(after) = start_after.take() {
                    staged.seek_ge(&format!("{}\u{0}", after))?;
                }
                while let Some(change) = staged.next().transpose()? {
                    cancel.check()?;
                    let Some(entry) = change.value else {
                        continue;
                    };
                    if entry.address_type != AddressType::Relative {
                        continue;
                    }
                    committed.seek_ge(change.key.as_str())?;
                    let in_head = committed
                        .peek()?
                        .is_some_and(|r| r.key == change.key && r.entry.physical_address == entry.physical_address);
                    if !in_head {
                        addresses.insert(entry.physical_address);
                    }
                    if addresses.len() >= limit {
                        continuation = Some(
                            ScanMark {
                                run_id: run_id.clone(),
                                page,
                                branch: name.to_string(),
                                token: token.to_string(),
                                after: change.key.into_string(),
                            }
                            .encode()?,
                        );
                        break 'branches;
                    }
                }
            }
        }

        let location = format!("{}/gc/uncommitted/{}/page-{:05}.json", self.prefix, run_id, page);
        let result = UncommittedGcPage {
            run_id,
            page,
            addresses,
            location,
            continuation,
        };
        self.store
            .put(namespace, &result.location, &serde_json::to_vec(&result)?)?;
        debug!(run_id = %result.run_id, page, addresses = result.addresses.len(), "wrote uncommitted gc page");
        if result.continuation.is_none() {
            info!(repository = %repository.name, run_id = %result.run_id, pages = page + 1, "uncommitted gc scan finished");
        }
        Ok(result)
    }
}
