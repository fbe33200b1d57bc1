//! Three-way merge.
//!
//! The merge compares what the source changed since the base against what
//! the destination changed since the base, key by key:
//!
//! | source          | destination     | result                        |
//! |-----------------|-----------------|-------------------------------|
//! | changed         | unchanged       | take source                   |
//! | unchanged       | changed         | keep destination              |
//! | changed to X    | changed to X    | keep destination              |
//! | changed to X    | changed to Y    | conflict, unless a strategy   |
//! | deleted         | modified        | [`DeleteModifyPolicy`]        |
//!
//! The output is the list of changes to apply onto the destination
//! snapshot, so ranges the source never touched stay shared.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cancel::CancelFlag;
use crate::committed::RecordIterator;
use crate::error::{Error, Result};
use crate::merge::diff::{DiffIterator, Difference};
use crate::storage::{same_value, Change, Entry, Key};

/// How to settle keys both sides changed differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// report a conflict
    #[default]
    None,
    SourceWins,
    DestWins,
}

impl FromStr for MergeStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "none" => Ok(MergeStrategy::None),
            "source-wins" => Ok(MergeStrategy::SourceWins),
            "dest-wins" => Ok(MergeStrategy::DestWins),
            other => Err(Error::InvalidValue(format!("unknown merge strategy: {}", other))),
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeStrategy::None => "none",
            MergeStrategy::SourceWins => "source-wins",
            MergeStrategy::DestWins => "dest-wins",
        };
        write!(f, "{}", name)
    }
}

/// What to do when one side deleted a key the other side modified.
///
/// Only consulted when no [`MergeStrategy`] is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteModifyPolicy {
    #[default]
    Conflict,
    KeepModified,
    KeepDeleted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOptions {
    pub strategy: MergeStrategy,
    pub delete_modify: DeleteModifyPolicy,
}

/// Changes to apply onto the destination, plus unresolved conflicts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub changes: Vec<Change>,
    pub conflicts: Vec<Key>,
}

impl MergeOutcome {
    pub fn into_changes(self) -> Result<Vec<Change>> {
        if !self.conflicts.is_empty() {
            return Err(Error::ConflictFound { paths: self.conflicts });
        }
        Ok(self.changes)
    }
}

enum Resolution {
    TakeSource,
    KeepDest,
    Conflict,
}

fn resolve(source: Option<&Entry>, dest: Option<&Entry>, options: &MergeOptions) -> Resolution {
    if same_value(source, dest) {
        return Resolution::KeepDest;
    }
    match options.strategy {
        MergeStrategy::SourceWins => return Resolution::TakeSource,
        MergeStrategy::DestWins => return Resolution::KeepDest,
        MergeStrategy::None => {}
    }
    match (source, dest, options.delete_modify) {
        (Some(_), Some(_), _) | (None, None, _) => Resolution::Conflict,
        (_, _, DeleteModifyPolicy::Conflict) => Resolution::Conflict,
        // the source holds the modified value
        (Some(_), None, DeleteModifyPolicy::KeepModified) => Resolution::TakeSource,
        (Some(_), None, DeleteModifyPolicy::KeepDeleted) => Resolution::KeepDest,
        // the source deleted
        (None, Some(_), DeleteModifyPolicy::KeepModified) => Resolution::KeepDest,
        (None, Some(_), DeleteModifyPolicy::KeepDeleted) => Resolution::TakeSource,
    }
}

fn source_change(difference: Difference) -> Result<Change> {
    let key = Key::new(difference.path)?;
    Ok(Change {
        key,
        value: difference.right,
    })
}

/// Compute the three-way merge of `source` into `dest` relative to `base`.
///
/// `base_*` iterators must be two independent cursors over the same base
/// snapshot.
pub fn three_way_merge<B1, S, B2, D>(
    base_for_source: B1,
    source: S,
    base_for_dest: B2,
    dest: D,
    options: &MergeOptions,
    cancel: &CancelFlag,
) -> Result<MergeOutcome>
where
    B1: RecordIterator,
    S: RecordIterator,
    B2: RecordIterator,
    D: RecordIterator,
{
    let mut source_diff = DiffIterator::new(base_for_source, source, cancel.clone()).peekable();
    let mut dest_diff = DiffIterator::new(base_for_dest, dest, cancel.clone()).peekable();
    let mut outcome = MergeOutcome::default();

    loop {
        cancel.check()?;
        let order = match (source_diff.peek(), dest_diff.peek()) {
            (None, _) => break,
            (Some(Err(_)), _) | (_, Some(Err(_))) => None,
            (Some(Ok(_)), None) => Some(std::cmp::Ordering::Less),
            (Some(Ok(s)), Some(Ok(d))) => Some(s.path.cmp(&d.path)),
        };
        match order {
            None => {
                // surface whichever side failed
                source_diff.next().transpose()?;
                dest_diff.next().transpose()?;
            }
            Some(std::cmp::Ordering::Less) => {
                if let Some(s) = source_diff.next().transpose()? {
                    outcome.changes.push(source_change(s)?);
                }
            }
            Some(std::cmp::Ordering::Greater) => {
                dest_diff.next().transpose()?;
            }
            Some(std::cmp::Ordering::Equal) => {
                let (Some(s), Some(d)) = (source_diff.next().transpose()?, dest_diff.next().transpose()?) else {
                    continue;
                };
                match resolve(s.right.as_ref(), d.right.as_ref(), options) {
                    Resolution::TakeSource => outcome.changes.push(source_change(s)?),
                    Resolution::KeepDest => {}
                    Resolution::Conflict => outcome.conflicts.push(Key::new(s.path)?),
                }
            }
        }
    }

    debug!(
        changes = outcome.changes.len(),
        conflicts = outcome.conflicts.len(),
        strategy = %options.strategy,
        "computed three-way merge"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::committed::VecRecordIterator;
    use crate::storage::Record;

    fn records(pairs: &[(&str, &str)]) -> Vec<Record> {
        pairs
            .iter()
            .map(|(k, v)| Record::new(Key::new(*k).unwrap(), entry(v)))
            .collect()
    }

    fn entry(addr: &str) -> Entry {
        Entry::new(addr, 1, "c")
    }

    fn merge(
        base: &[(&str, &str)],
        source: &[(&str, &str)],
        dest: &[(&str, &str)],
        options: MergeOptions,
    ) -> MergeOutcome {
        three_way_merge(
            VecRecordIterator::new(records(base)),
            VecRecordIterator::new(records(source)),
            VecRecordIterator::new(records(base)),
            VecRecordIterator::new(records(dest)),
            &options,
            &CancelFlag::new(),
        )
        .unwrap()
    }

    fn summarize(changes: &[Change]) -> Vec<(String, Option<String>)> {
        changes
            .iter()
            .map(|c| (c.key.to_string(), c.value.as_ref().map(|e| e.physical_address.clone())))
            .collect()
    }

    #[test]
    fn test_disjoint_changes() {
        let outcome = merge(
            &[("a", "1"), ("b", "2")],
            &[("a", "1"), ("b", "2"), ("d", "4")],
            &[("a", "1"), ("e", "5")],
            MergeOptions::default(),
        );
        assert!(outcome.conflicts.is_empty());
        assert_eq!(summarize(&outcome.changes), vec![("d".to_string(), Some("4".to_string()))]);
    }

    #[test]
    fn test_same_change_both_sides() {
        let outcome = merge(
            &[("x", "1")],
            &[("x", "2"), ("y", "3")],
            &[("x", "2"), ("y", "3")],
            MergeOptions::default(),
        );
        assert!(outcome.conflicts.is_empty());
        assert!(outcome.changes.is_empty());
    }

    #[test]
    fn test_conflict_and_strategies() {
        let base = [("x", "1")];
        let source = [("x", "2")];
        let dest = [("x", "3")];

        let outcome = merge(&base, &source, &dest, MergeOptions::default());
        assert_eq!(outcome.conflicts, vec![Key::new("x").unwrap()]);
        assert!(matches!(outcome.into_changes(), Err(Error::ConflictFound { .. })));

        let source_wins = MergeOptions {
            strategy: MergeStrategy::SourceWins,
            ..MergeOptions::default()
        };
        let outcome = merge(&base, &source, &dest, source_wins);
        assert_eq!(summarize(&outcome.changes), vec![("x".to_string(), Some("2".to_string()))]);

        let dest_wins = MergeOptions {
            strategy: MergeStrategy::DestWins,
            ..MergeOptions::default()
        };
        let outcome = merge(&base, &source, &dest, dest_wins);
        assert!(outcome.changes.is_empty() && outcome.conflicts.is_empty());
    }

    #[test]
    fn test_delete_modify_policy_source_deletes() {
        let base = [("x", "1")];
        let source: [(&str, &str); 0] = [];
        let dest = [("x", "2")];
        let with = |policy| MergeOptions {
            delete_modify: policy,
            ..MergeOptions::default()
        };

        let outcome = merge(&base, &source, &dest, with(DeleteModifyPolicy::Conflict));
        assert_eq!(outcome.conflicts.len(), 1);

        let outcome = merge(&base, &source, &dest, with(DeleteModifyPolicy::KeepModified));
        assert!(outcome.changes.is_empty() && outcome.conflicts.is_empty());

        let outcome = merge(&base, &source, &dest, with(DeleteModifyPolicy::KeepDeleted));
        assert_eq!(summarize(&outcome.changes), vec![("x".to_string(), None)]);
    }

    #[test]
    fn test_delete_modify_policy_dest_deletes() {
        let base = [("x", "1")];
        let source = [("x", "2")];
        let dest: [(&str, &str); 0] = [];
        let with = |policy| MergeOptions {
            delete_modify: policy,
            ..MergeOptions::default()
        };

        let outcome = merge(&base, &source, &dest, with(DeleteModifyPolicy::Conflict));
        assert_eq!(outcome.conflicts.len(), 1);

        let outcome = merge(&base, &source, &dest, with(DeleteModifyPolicy::KeepModified));
        assert_eq!(summarize(&outcome.changes), vec![("x".to_string(), Some("2".to_string()))]);

        let outcome = merge(&base, &source, &dest, with(DeleteModifyPolicy::KeepDeleted));
        assert!(outcome.changes.is_empty() && outcome.conflicts.is_empty());
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!("source-wins".parse::<MergeStrategy>().unwrap(), MergeStrategy::SourceWins);
        assert_eq!(MergeStrategy::DestWins.to_string(), "dest-wins");
        assert!("theirs".parse::<MergeStrategy>().is_err());
    }
}
