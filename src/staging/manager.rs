//! Staging areas: per-token sets of uncommitted writes and tombstones.
//!
//! Each token owns one kv partition. A staged value is either an entry or a
//! tombstone (`None`), stored as JSON under the entry's key.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::storage::{Change, Entry, Key, KvStore, StagingToken};

/// Cursor over the staged changes of one token, paging through the kv store.
pub trait ChangeIterator: Iterator<Item = Result<Change>> {
    /// Position before the first change whose key is `>= key`.
    fn seek_ge(&mut self, key: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct StagingManager {
    kv: Arc<dyn KvStore>,
    batch_size: usize,
}

impl StagingManager {
    pub fn new(kv: Arc<dyn KvStore>, batch_size: usize) -> Self {
        Self {
            kv,
            batch_size: batch_size.max(1),
        }
    }

    fn partition(token: &StagingToken) -> String {
        format!("staging/{}", token)
    }

    /// The staged value for `key`: `None` if nothing is staged,
    /// `Some(None)` for a tombstone.
    pub fn get(&self, token: &StagingToken, key: &str) -> Result<Option<Option<Entry>>> {
        match self.kv.get(&Self::partition(token), key)? {
            Some(found) => Ok(Some(serde_json::from_slice(&found.value)?)),
            None => Ok(None),
        }
    }

    /// Stage an entry, or a tombstone when `value` is `None`.
    pub fn set(&self, token: &StagingToken, key: &Key, value: Option<&Entry>) -> Result<()> {
        let bytes = serde_json::to_vec(&value)?;
        self.kv.set(&Self::partition(token), key.as_str(), &bytes)?;
        Ok(())
    }

    /// Remove whatever is staged for `key`.
    pub fn drop_key(&self, token: &StagingToken, key: &str) -> Result<()> {
        self.kv.delete(&Self::partition(token), key)?;
        Ok(())
    }

    /// Remove every staged key under `prefix`; returns how many were dropped.
    pub fn drop_prefix(&self, token: &StagingToken, prefix: &str) -> Result<usize> {
        let partition = Self::partition(token);
        let mut dropped = 0;
        loop {
            let page = self.kv.scan(&partition, prefix, self.batch_size)?;
            let keys: Vec<String> = page
                .into_iter()
                .map(|(key, _)| key)
                .take_while(|key| key.starts_with(prefix))
                .collect();
            if keys.is_empty() {
                break;
            }
            for key in &keys {
                self.kv.delete(&partition, key)?;
            }
            dropped += keys.len();
        }
        debug!(token = %token, prefix, dropped, "dropped staged prefix");
        Ok(dropped)
    }

    /// Discard a whole staging area.
    pub fn drop_token(&self, token: &StagingToken) -> Result<()> {
        self.kv.delete_partition(&Self::partition(token))?;
        debug!(token = %token, "dropped staging token");
        Ok(())
    }

    pub fn is_empty(&self, token: &StagingToken) -> Result<bool> {
        Ok(self.kv.scan(&Self::partition(token), "", 1)?.is_empty())
    }

    /// Every staged change of `token`, ascending by key.
    pub fn changes(&self, token: &StagingToken) -> StagingIterator {
        StagingIterator {
            kv: self.kv.clone(),
            partition: Self::partition(token),
            batch_size: self.batch_size,
            buffer: VecDeque::new(),
            next_start: Some(String::new()),
        }
    }
}

/// Pages through one staging partition.
pub struct StagingIterator {
    kv: Arc<dyn KvStore>,
    partition: String,
    batch_size: usize,
    buffer: VecDeque<Change>,
    /// `None` once the partition is exhausted
    next_start: Option<String>,
}

impl StagingIterator {
    fn fill(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            return Ok(());
        }
        let Some(start) = self.next_start.take() else {
            return Ok(());
        };
        let page = self.kv.scan(&self.partition, &start, self.batch_size)?;
        if page.len() >= self.batch_size {
            if let Some((last, _)) = page.last() {
                self.next_start = Some(format!("{}\u{0}", last));
            }
        }
        for (key, bytes) in page {
            let value: Option<Entry> = serde_json::from_slice(&bytes)?;
            self.buffer.push_back(Change {
                key: Key::new(key)?,
                value,
            });
        }
        Ok(())
    }
}

impl Iterator for StagingIterator {
    type Item = Result<Change>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.fill() {
            Ok(()) => self.buffer.pop_front().map(Ok),
            Err(e) => {
                self.next_start = None;
                self.buffer.clear();
                Some(Err(e))
            }
        }
    }
}

impl ChangeIterator for StagingIterator {
    fn seek_ge(&mut self, key: &str) -> Result<()> {
        while self.buffer.front().is_some_and(|c| c.key.as_str() < key) {
            self.buffer.pop_front();
        }
        if self.buffer.is_empty() {
            if let Some(start) = &self.next_start {
                if start.as_str() < key {
                    self.next_start = Some(key.to_string());
                }
            }
        }
        Ok(())
    }
}
