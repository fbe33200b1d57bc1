//! Lowest common ancestor of two commits.

use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap};

use crate::cancel::CancelFlag;
use crate::error::Result;
use crate::graph::commit::{CommitGraph, CommitRecord};
use crate::storage::CommitId;

const FROM_LEFT: u8 = 0b01;
const FROM_RIGHT: u8 = 0b10;
const FROM_BOTH: u8 = FROM_LEFT | FROM_RIGHT;

/// Find the best common ancestor of `left` and `right`.
///
/// Walks parent edges from both commits at once, always expanding the
/// commit with the highest generation. The first commit reached from both
/// sides is returned; `None` means the histories are disjoint.
pub fn find_merge_base(
    graph: &dyn CommitGraph,
    namespace: &str,
    left: &CommitId,
    right: &CommitId,
    cancel: &CancelFlag,
) -> Result<Option<CommitRecord>> {
    let left_commit = graph.get_commit(namespace, left)?;
    if left == right {
        return Ok(Some(left_commit));
    }
    let right_commit = graph.get_commit(namespace, right)?;

    let mut flags: HashMap<CommitId, u8> = HashMap::new();
    let mut records: HashMap<CommitId, CommitRecord> = HashMap::new();
    let mut queue: BinaryHeap<(u64, CommitId)> = BinaryHeap::new();

    for (record, flag) in [(left_commit, FROM_LEFT), (right_commit, FROM_RIGHT)] {
        flags.insert(record.id.clone(), flag);
        queue.push((record.commit.generation, record.id.clone()));
        records.insert(record.id.clone(), record);
    }

    while let Some((_, id)) = queue.pop() {
        cancel.check()?;
        let flag = flags.get(&id).copied().unwrap_or_default();
        let Some(record) = records.get(&id).cloned() else {
            continue;
        };
        if flag == FROM_BOTH {
            return Ok(Some(record));
        }
        for parent in &record.commit.parents {
            let changed = match flags.entry(parent.clone()) {
                Entry::Occupied(mut existing) => {
                    let merged = *existing.get() | flag;
                    let changed = merged != *existing.get();
                    existing.insert(merged);
                    changed
                }
                Entry::Vacant(slot) => {
                    slot.insert(flag);
                    true
                }
            };
            if changed {
                if !records.contains_key(parent) {
                    let parent_record = graph.get_commit(namespace, parent)?;
                    records.insert(parent.clone(), parent_record);
                }
                if let Some(parent_record) = records.get(parent) {
                    queue.push((parent_record.commit.generation, parent.clone()));
                }
            }
        }
    }
    Ok(None)
}

/// true if `ancestor` is reachable from `descendant` (or equal to it)
pub fn is_ancestor(
    graph: &dyn CommitGraph,
    namespace: &str,
    ancestor: &CommitId,
    descendant: &CommitId,
    cancel: &CancelFlag,
) -> Result<bool> {
    Ok(find_merge_base(graph, namespace, ancestor, descendant, cancel)?
        .is_some_and(|base| &base.id == ancestor))
}
