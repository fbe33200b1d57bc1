//! Diff and merge over ordered record streams.

mod diff;
#[allow(clippy::module_inception)]
mod merge;

pub use diff::{list_diff, DiffIterator, DiffType, Difference, PathType};
pub use merge::{three_way_merge, DeleteModifyPolicy, MergeOptions, MergeOutcome, MergeStrategy};
