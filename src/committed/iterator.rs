//! Lazy, seekable cursors over committed records.

use std::collections::VecDeque;

use crate::committed::range::{RangeDescriptor, RangeManager};
use crate::error::Result;
use crate::storage::Record;

/// An ascending stream of records that can jump forward.
pub trait RecordIterator: Iterator<Item = Result<Record>> {
    /// Position before the first record whose key is `>= key`.
    ///
    /// Seeking backwards is not supported; a seek to a key at or before the
    /// current position is a no-op.
    fn seek_ge(&mut self, key: &str) -> Result<()>;

    /// The next range, if the cursor sits exactly at its start.
    ///
    /// Only cursors over committed ranges know about range boundaries.
    fn at_range_start(&self) -> Option<&RangeDescriptor> {
        None
    }

    /// Skip the range reported by [`Self::at_range_start`].
    fn skip_range(&mut self) {}
}

/// Iterates the records of a metarange, loading one range at a time.
///
/// Between ranges the cursor can report the next range header, which lets
/// a diff skip a whole range that both sides share without reading it.
pub struct EntryIterator {
    ranges: RangeManager,
    namespace: String,
    pending: VecDeque<RangeDescriptor>,
    records: VecDeque<Record>,
}

impl EntryIterator {
    pub(crate) fn new(ranges: RangeManager, namespace: &str, descriptors: Vec<RangeDescriptor>) -> Self {
        Self {
            ranges,
            namespace: namespace.to_string(),
            pending: descriptors.into(),
            records: VecDeque::new(),
        }
    }

    fn load_next(&mut self) -> Result<bool> {
        while self.records.is_empty() {
            let Some(descriptor) = self.pending.pop_front() else {
                return Ok(false);
            };
            self.records = self.ranges.read_range(&self.namespace, &descriptor.id)?.collect();
        }
        Ok(true)
    }

    pub fn peek(&mut self) -> Result<Option<&Record>> {
        self.load_next()?;
        Ok(self.records.front())
    }

    pub fn next_record(&mut self) -> Result<Option<Record>> {
        self.load_next()?;
        Ok(self.records.pop_front())
    }
}

impl Iterator for EntryIterator {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

impl RecordIterator for EntryIterator {
    fn at_range_start(&self) -> Option<&RangeDescriptor> {
        if self.records.is_empty() {
            self.pending.front()
        } else {
            None
        }
    }

    fn skip_range(&mut self) {
        if self.records.is_empty() {
            self.pending.pop_front();
        }
    }

    fn seek_ge(&mut self, key: &str) -> Result<()> {
        while self.records.front().is_some_and(|r| r.key.as_str() < key) {
            self.records.pop_front();
        }
        if !self.records.is_empty() {
            return Ok(());
        }
        while self.pending.front().is_some_and(|d| d.max_key.as_str() < key) {
            self.pending.pop_front();
        }
        // the first remaining range may start before the key
        if self.pending.front().is_some_and(|d| d.min_key.as_str() < key) {
            self.load_next()?;
            while self.records.front().is_some_and(|r| r.key.as_str() < key) {
                self.records.pop_front();
            }
        }
        Ok(())
    }
}

/// Records held in memory; used for small inputs and tests.
pub struct VecRecordIterator {
    records: VecDeque<Record>,
}

impl VecRecordIterator {
    /// `records` must already be ascending by key
    pub fn new(records: Vec<Record>) -> Self {
        Self { records: records.into() }
    }
}

impl Iterator for VecRecordIterator {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.records.pop_front().map(Ok)
    }
}

impl RecordIterator for VecRecordIterator {
    fn seek_ge(&mut self, key: &str) -> Result<()> {
        while self.records.front().is_some_and(|r| r.key.as_str() < key) {
            self.records.pop_front();
        }
        Ok(())
    }
}

impl<I: RecordIterator + ?Sized> RecordIterator for Box<I> {
    fn seek_ge(&mut self, key: &str) -> Result<()> {
        (**self).seek_ge(key)
    }

    fn at_range_start(&self) -> Option<&RangeDescriptor> {
        (**self).at_range_start()
    }

    fn skip_range(&mut self) {
        (**self).skip_range()
    }
}
