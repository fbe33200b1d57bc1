//! Committed data: immutable ranges and the metaranges that group them into
//! snapshots.
//!
//! Nothing in this module ever mutates a blob. A commit's snapshot is a
//! [`MetaRangeId`](crate::storage::MetaRangeId); two snapshots that differ
//! in a handful of keys share every range those keys don't fall into.

mod iterator;
mod listing;
mod metarange;
mod range;

pub use iterator::{EntryIterator, RecordIterator, VecRecordIterator};
pub use listing::{list_records, ListOptions, Listing};
pub use metarange::{ApplySummary, MetaRangeManager, MetaRangeWriter};
pub use range::{RangeConfig, RangeDescriptor, RangeManager, RangeWriter};

pub(crate) use listing::{common_prefix, prefix_upper_bound};
