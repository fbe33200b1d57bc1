//! Combining staging areas with each other and with committed data.
//!
//! A branch is read through up to three layers: its current staging token,
//! its sealed tokens (newest first) and its committed snapshot. The first
//! layer holding a key wins; a tombstone there hides the key entirely.

use crate::committed::RecordIterator;
use crate::error::Result;
use crate::staging::manager::{ChangeIterator, StagingIterator};
use crate::storage::{Change, Record};

/// Staged changes of several tokens merged by key, earlier sources first.
pub struct StagedChanges {
    sources: Vec<StagingIterator>,
    heads: Vec<Option<Change>>,
}

impl StagedChanges {
    /// `sources` are ordered by priority, the newest token first.
    pub fn new(mut sources: Vec<StagingIterator>) -> Result<Self> {
        let mut heads = Vec::with_capacity(sources.len());
        for source in &mut sources {
            heads.push(source.next().transpose()?);
        }
        Ok(Self { sources, heads })
    }

    fn advance(&mut self) -> Result<Option<Change>> {
        let min_key = self
            .heads
            .iter()
            .flatten()
            .map(|change| change.key.clone())
            .min();
        let Some(min_key) = min_key else {
            return Ok(None);
        };

        let mut winner = None;
        for (head, source) in self.heads.iter_mut().zip(self.sources.iter_mut()) {
            if head.as_ref().is_some_and(|c| c.key == min_key) {
                let taken = head.take();
                *head = source.next().transpose()?;
                if winner.is_none() {
                    winner = taken;
                }
            }
        }
        Ok(winner)
    }
}

impl Iterator for StagedChanges {
    type Item = Result<Change>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}

impl ChangeIterator for StagedChanges {
    fn seek_ge(&mut self, key: &str) -> Result<()> {
        for (head, source) in self.heads.iter_mut().zip(self.sources.iter_mut()) {
            if head.as_ref().is_some_and(|c| c.key.as_str() < key) {
                source.seek_ge(key)?;
                *head = source.next().transpose()?;
            }
        }
        Ok(())
    }
}

/// Committed records as seen through staged changes.
pub struct Overlay<C> {
    staged: StagedChanges,
    committed: C,
    staged_head: Option<Change>,
    committed_head: Option<Record>,
}

impl<C: RecordIterator> Overlay<C> {
    pub fn new(mut staged: StagedChanges, mut committed: C) -> Result<Self> {
        let staged_head = staged.next().transpose()?;
        let committed_head = committed.next().transpose()?;
        Ok(Self {
            staged,
            committed,
            staged_head,
            committed_head,
        })
    }

    fn advance(&mut self) -> Result<Option<Record>> {
        loop {
            let take_staged = match (&self.staged_head, &self.committed_head) {
                (None, None) => return Ok(None),
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (Some(change), Some(record)) => change.key <= record.key,
            };
            if !take_staged {
                let record = self.committed_head.take();
                self.committed_head = self.committed.next().transpose()?;
                return Ok(record);
            }

            let Some(change) = self.staged_head.take() else {
                continue;
            };
            self.staged_head = self.staged.next().transpose()?;
            if self.committed_head.as_ref().is_some_and(|r| r.key == change.key) {
                self.committed_head = self.committed.next().transpose()?;
            }
            if let Some(entry) = change.value {
                return Ok(Some(Record::new(change.key, entry)));
            }
        }
    }
}

impl<C: RecordIterator> Iterator for Overlay<C> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}

impl<C: RecordIterator> RecordIterator for Overlay<C> {
    fn seek_ge(&mut self, key: &str) -> Result<()> {
        if self.staged_head.as_ref().is_some_and(|c| c.key.as_str() < key) {
            self.staged.seek_ge(key)?;
            self.staged_head = self.staged.next().transpose()?;
        }
        if self.committed_head.as_ref().is_some_and(|r| r.key.as_str() < key) {
            self.committed.seek_ge(key)?;
            self.committed_head = self.committed.next().transpose()?;
        }
        Ok(())
    }
}
