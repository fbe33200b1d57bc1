//! Two-way diff: a merge-join of two ordered record streams.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::cancel::CancelFlag;
use crate::committed::{common_prefix, prefix_upper_bound, ListOptions, RecordIterator};
use crate::error::Result;
use crate::storage::{same_value, Entry, Key, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffType {
    Added,
    Removed,
    Changed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathType {
    Object,
    CommonPrefix,
}

/// One difference between the left and right side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Difference {
    pub path: String,
    pub path_type: PathType,
    pub diff_type: DiffType,
    /// right-side size, or left-side size for removals; summed for prefixes
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left: Option<Entry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right: Option<Entry>,
}

impl Difference {
    fn object(key: Key, left: Option<Entry>, right: Option<Entry>) -> Self {
        let diff_type = match (&left, &right) {
            (None, _) => DiffType::Added,
            (_, None) => DiffType::Removed,
            _ => DiffType::Changed,
        };
        let size = right.as_ref().or(left.as_ref()).map_or(0, |e| e.size);
        Self {
            path: key.into_string(),
            path_type: PathType::Object,
            diff_type,
            size,
            left,
            right,
        }
    }

    /// the key of an object difference
    pub fn key(&self) -> Option<Key> {
        match self.path_type {
            PathType::Object => Key::new(self.path.clone()).ok(),
            PathType::CommonPrefix => None,
        }
    }
}

/// Merge-join of `left` and `right`, yielding only keys that differ.
///
/// Whenever both cursors sit at the start of ranges with the same id, the
/// range is skipped on both sides without being read.
pub struct DiffIterator<L, R> {
    left: L,
    right: R,
    left_head: Option<Record>,
    right_head: Option<Record>,
    cancel: CancelFlag,
}

impl<L: RecordIterator, R: RecordIterator> DiffIterator<L, R> {
    pub fn new(left: L, right: R, cancel: CancelFlag) -> Self {
        Self {
            left,
            right,
            left_head: None,
            right_head: None,
            cancel,
        }
    }

    /// Position before the first difference whose key is `>= key`.
    pub fn seek_ge(&mut self, key: &str) -> Result<()> {
        if self.left_head.as_ref().is_some_and(|r| r.key.as_str() < key) {
            self.left_head = None;
        }
        if self.right_head.as_ref().is_some_and(|r| r.key.as_str() < key) {
            self.right_head = None;
        }
        if self.left_head.is_none() {
            self.left.seek_ge(key)?;
        }
        if self.right_head.is_none() {
            self.right.seek_ge(key)?;
        }
        Ok(())
    }

    fn skip_shared_ranges(&mut self) {
        if self.left_head.is_some() || self.right_head.is_some() {
            return;
        }
        loop {
            let shared = match (self.left.at_range_start(), self.right.at_range_start()) {
                (Some(l), Some(r)) => l.id == r.id,
                _ => false,
            };
            if !shared {
                return;
            }
            trace!("skipping shared range");
            self.left.skip_range();
            self.right.skip_range();
        }
    }

    fn advance(&mut self) -> Result<Option<Difference>> {
        loop {
            self.cancel.check()?;
            self.skip_shared_ranges();
            if self.left_head.is_none() {
                self.left_head = self.left.next().transpose()?;
            }
            if self.right_head.is_none() {
                self.right_head = self.right.next().transpose()?;
            }

            let (take_left, take_right) = match (&self.left_head, &self.right_head) {
                (None, None) => return Ok(None),
                (Some(_), None) => (true, false),
                (None, Some(_)) => (false, true),
                (Some(l), Some(r)) => (l.key <= r.key, r.key <= l.key),
            };
            let left = if take_left { self.left_head.take() } else { None };
            let right = if take_right { self.right_head.take() } else { None };

            match (left, right) {
                (Some(l), Some(r)) => {
                    if !same_value(Some(&l.entry), Some(&r.entry)) {
                        return Ok(Some(Difference::object(r.key, Some(l.entry), Some(r.entry))));
                    }
                }
                (Some(l), None) => return Ok(Some(Difference::object(l.key, Some(l.entry), None))),
                (None, Some(r)) => return Ok(Some(Difference::object(r.key, None, Some(r.entry)))),
                (None, None) => return Ok(None),
            }
        }
    }
}

impl<L: RecordIterator, R: RecordIterator> Iterator for DiffIterator<L, R> {
    type Item = Result<Difference>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}

/// Collect a diff page honoring prefix, after, delimiter and limit.
///
/// With a delimiter, every difference under a common prefix collapses into
/// one entry whose type is shared by all its members, or `Changed` when
/// they disagree, and whose size is the sum of theirs.
pub fn list_diff<L, R>(diff: &mut DiffIterator<L, R>, options: &ListOptions) -> Result<Vec<Difference>>
where
    L: RecordIterator,
    R: RecordIterator,
{
    let limit = options.limit.unwrap_or(usize::MAX);
    let mut out: Vec<Difference> = Vec::new();
    if limit == 0 {
        return Ok(out);
    }
    diff.seek_ge(&options.start_key())?;

    // the collapsed prefix currently being accumulated
    let mut open: Option<Difference> = None;

    while let Some(difference) = diff.next().transpose()? {
        if !difference.path.starts_with(&options.prefix) {
            break;
        }
        let collapsed = options
            .delimiter
            .as_deref()
            .and_then(|d| common_prefix(&difference.path, &options.prefix, d))
            .map(str::to_string);

        match collapsed {
            Some(common) => {
                if options.after.as_deref().is_some_and(|a| common.as_str() <= a) {
                    match prefix_upper_bound(&common) {
                        Some(next) => {
                            diff.seek_ge(&next)?;
                            continue;
                        }
                        None => break,
                    }
                }
                match open.as_mut() {
                    Some(current) if current.path == common => {
                        if current.diff_type != difference.diff_type {
                            current.diff_type = DiffType::Changed;
                        }
                        current.size += difference.size;
                    }
                    _ => {
                        if let Some(done) = open.take() {
                            out.push(done);
                            if out.len() >= limit {
                                return Ok(out);
                            }
                        }
                        open = Some(Difference {
                            path: common,
                            path_type: PathType::CommonPrefix,
                            diff_type: difference.diff_type,
                            size: difference.size,
                            left: None,
                            right: None,
                        });
                    }
                }
            }
            None => {
                if let Some(done) = open.take() {
                    out.push(done);
                    if out.len() >= limit {
                        return Ok(out);
                    }
                }
                out.push(difference);
                if out.len() >= limit {
                    return Ok(out);
                }
            }
        }
    }
    if let Some(done) = open.take() {
        if out.len() < limit {
            out.push(done);
        }
    }
    Ok(out)
}
