//! Uncommitted data.
//!
//! Writes to a branch land in the branch's staging token and shadow its
//! committed snapshot until the next commit folds them in.

mod manager;
mod overlay;

pub use manager::{ChangeIterator, StagingIterator, StagingManager};
pub use overlay::{Overlay, StagedChanges};
