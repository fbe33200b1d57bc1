//! Garbage collection.
//!
//! Collection is split in two: the engine marks what must stay (committed
//! and uncommitted), and a sweeper outside the engine deletes the rest.

mod mark;
mod rules;
mod sweep;
mod uncommitted;

pub use mark::{compute_closure, mark_commits, read_report, write_report, Closure, CommitMark, GcReport, GcRun, GcRunState};
pub use rules::{BranchRetention, GarbageCollectionRules};
pub use sweep::{sweep, PhysicalObject, PhysicalObjectStore, SweepReport};
pub use uncommitted::{UncommittedGcPage, UncommittedScanner};
