//! History traversal.

use std::collections::{BinaryHeap, HashSet};
use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::cancel::CancelFlag;
use crate::error::Result;
use crate::graph::commit::{CommitGraph, CommitRecord};
use crate::storage::CommitId;

/// Decides whether a commit is included in a log; used for path filters.
pub type CommitFilter<'a> = Box<dyn FnMut(&CommitRecord) -> Result<bool> + 'a>;

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// follow only the first parent of merge commits
    pub first_parent_only: bool,
    pub limit: Option<usize>,
    /// stop at commits created before this instant
    pub since: Option<DateTime<Utc>>,
}

/// heap entry: newest first, ties broken by generation then id
struct Queued(CommitRecord);

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .commit
            .creation_date
            .cmp(&other.0.commit.creation_date)
            .then(self.0.commit.generation.cmp(&other.0.commit.generation))
            .then_with(|| self.0.id.cmp(&other.0.id))
    }
}

/// Reverse-chronological walk over the parents of a commit.
pub struct CommitLog<'a> {
    graph: &'a dyn CommitGraph,
    namespace: String,
    options: LogOptions,
    filter: Option<CommitFilter<'a>>,
    cancel: CancelFlag,
    queue: BinaryHeap<Queued>,
    seen: HashSet<CommitId>,
    returned: usize,
    done: bool,
}

impl<'a> CommitLog<'a> {
    pub fn new(
        graph: &'a dyn CommitGraph,
        namespace: &str,
        from: &CommitId,
        options: LogOptions,
        cancel: CancelFlag,
    ) -> Result<Self> {
        let start = graph.get_commit(namespace, from)?;
        let mut seen = HashSet::new();
        seen.insert(start.id.clone());
        let mut queue = BinaryHeap::new();
        queue.push(Queued(start));
        Ok(Self {
            graph,
            namespace: namespace.to_string(),
            options,
            filter: None,
            cancel,
            queue,
            seen,
            returned: 0,
            done: false,
        })
    }

    /// only return commits accepted by `filter`; the walk itself is unchanged
    pub fn with_filter(mut self, filter: CommitFilter<'a>) -> Self {
        self.filter = Some(filter);
        self
    }

    fn advance(&mut self) -> Result<Option<CommitRecord>> {
        loop {
            if self.options.limit.is_some_and(|limit| self.returned >= limit) {
                return Ok(None);
            }
            self.cancel.check()?;
            let Some(Queued(record)) = self.queue.pop() else {
                return Ok(None);
            };
            if self.options.since.is_some_and(|since| record.commit.creation_date < since) {
                return Ok(None);
            }

            let parents = if self.options.first_parent_only {
                &record.commit.parents[..record.commit.parents.len().min(1)]
            } else {
                &record.commit.parents[..]
            };
            for parent in parents {
                if self.seen.insert(parent.clone()) {
                    let parent = self.graph.get_commit(&self.namespace, parent)?;
                    self.queue.push(Queued(parent));
                }
            }

            let keep = match self.filter.as_mut() {
                Some(filter) => filter(&record)?,
                None => true,
            };
            if keep {
                self.returned += 1;
                return Ok(Some(record));
            }
        }
    }
}

impl Iterator for CommitLog<'_> {
    type Item = Result<CommitRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.advance().transpose();
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}
