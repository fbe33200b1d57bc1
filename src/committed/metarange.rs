//! MetaRanges: an ordered, non-overlapping list of range descriptors that
//! together form one snapshot of a repository.
//!
//! Changing a snapshot never rewrites it. [`MetaRangeManager::apply`]
//! merge-joins a sorted change stream into the base snapshot and writes a
//! new metarange that points at the very same range blobs wherever no
//! effective change landed.

use std::iter::Peekable;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cancel::CancelFlag;
use crate::committed::iterator::EntryIterator;
use crate::committed::listing::{list_records, ListOptions, Listing};
use crate::committed::range::{RangeDescriptor, RangeManager, RangeWriter};
use crate::error::{Error, Result};
use crate::storage::{content_hash, same_value, BlobStore, Change, Key, MetaRangeId, Record, StorageError};

#[derive(Serialize, Deserialize)]
struct MetaRangeData {
    ranges: Vec<RangeDescriptor>,
}

/// Counts of effective changes made by [`MetaRangeManager::apply`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub added: usize,
    pub changed: usize,
    pub removed: usize,
}

impl ApplySummary {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.changed == 0 && self.removed == 0
    }

    pub fn total(&self) -> usize {
        self.added + self.changed + self.removed
    }
}

#[derive(Clone)]
pub struct MetaRangeManager {
    store: Arc<dyn BlobStore>,
    prefix: String,
    ranges: RangeManager,
}

impl MetaRangeManager {
    pub fn new(store: Arc<dyn BlobStore>, prefix: impl Into<String>, ranges: RangeManager) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            ranges,
        }
    }

    pub fn ranges(&self) -> &RangeManager {
        &self.ranges
    }

    pub(crate) fn metarange_key(&self, id: &MetaRangeId) -> String {
        format!("{}/metaranges/{}", self.prefix, id)
    }

    /// Persist an ordered list of ranges.
    pub fn write_metarange(&self, namespace: &str, ranges: Vec<RangeDescriptor>) -> Result<MetaRangeId> {
        for descriptor in &ranges {
            if descriptor.max_key < descriptor.min_key {
                return Err(Error::OrderingViolation {
                    previous: descriptor.min_key.to_string(),
                    key: descriptor.max_key.to_string(),
                });
            }
        }
        for pair in ranges.windows(2) {
            if pair[1].min_key <= pair[0].max_key {
                return Err(Error::OrderingViolation {
                    previous: pair[0].max_key.to_string(),
                    key: pair[1].min_key.to_string(),
                });
            }
        }

        let bytes = serde_json::to_vec(&MetaRangeData { ranges })?;
        let id = MetaRangeId::from_digest(content_hash(&bytes));
        let key = self.metarange_key(&id);
        if !self.store.exists(namespace, &key)? {
            self.store.put(namespace, &key, &bytes)?;
            debug!(metarange_id = %id, "wrote metarange");
        }
        Ok(id)
    }

    /// The snapshot with no entries.
    pub fn write_empty(&self, namespace: &str) -> Result<MetaRangeId> {
        self.write_metarange(namespace, Vec::new())
    }

    pub fn read_metarange(&self, namespace: &str, id: &MetaRangeId) -> Result<Vec<RangeDescriptor>> {
        let bytes = self
            .store
            .get(namespace, &self.metarange_key(id))
            .map_err(|e| match e {
                StorageError::BlobNotFound { .. } => Error::MetaRangeNotFound(id.to_string()),
                other => Error::Storage(other),
            })?;
        let data: MetaRangeData = serde_json::from_slice(&bytes)?;
        Ok(data.ranges)
    }

    /// Cursor over every record of a snapshot.
    pub fn entries(&self, namespace: &str, id: &MetaRangeId) -> Result<EntryIterator> {
        let descriptors = self.read_metarange(namespace, id)?;
        Ok(EntryIterator::new(self.ranges.clone(), namespace, descriptors))
    }

    /// Look up a single key, reading at most one range.
    pub fn get_entry(&self, namespace: &str, id: &MetaRangeId, key: &str) -> Result<Option<Record>> {
        let descriptors = self.read_metarange(namespace, id)?;
        let Some(descriptor) = descriptors.iter().find(|d| d.contains(key)) else {
            return Ok(None);
        };
        Ok(self
            .ranges
            .read_range(namespace, &descriptor.id)?
            .find(|r| r.key.as_str() == key))
    }

    /// List a snapshot; only ranges overlapping the requested window are read.
    pub fn list_entries(&self, namespace: &str, id: &MetaRangeId, options: &ListOptions) -> Result<Vec<Listing>> {
        let mut iter = self.entries(namespace, id)?;
        list_records(&mut iter, options)
    }

    pub fn writer(&self, namespace: &str) -> MetaRangeWriter {
        MetaRangeWriter {
            manager: self.clone(),
            namespace: namespace.to_string(),
            records: self.ranges.writer(namespace),
            descriptors: Vec::new(),
            last_key: None,
        }
    }

    /// Write a snapshot from ascending records.
    pub fn write_records(
        &self,
        namespace: &str,
        records: impl IntoIterator<Item = Record>,
    ) -> Result<MetaRangeId> {
        let mut writer = self.writer(namespace);
        for record in records {
            writer.add_record(record)?;
        }
        writer.finish()
    }

    /// Merge-join ascending `changes` into `base`.
    ///
    /// A tombstone for an absent key and a value identical to the stored one
    /// are not effective changes. Ranges receiving no effective change are
    /// carried over by id.
    pub fn apply<I>(
        &self,
        namespace: &str,
        base: &MetaRangeId,
        changes: I,
        cancel: &CancelFlag,
    ) -> Result<(MetaRangeId, ApplySummary)>
    where
        I: Iterator<Item = Result<Change>>,
    {
        let descriptors = self.read_metarange(namespace, base)?;
        let mut changes = OrderedChanges::new(changes).peekable();
        let mut writer = self.writer(namespace);
        let mut summary = ApplySummary::default();

        for descriptor in descriptors {
            cancel.check()?;
            // changes falling in the gap before this range are inserts
            while let Some(change) = next_if_before(&mut changes, descriptor.min_key.as_str())? {
                if let Some(entry) = change.value {
                    writer.add_record(Record::new(change.key, entry))?;
                    summary.added += 1;
                }
            }

            let touches = match changes.peek() {
                Some(Ok(change)) => change.key <= descriptor.max_key,
                Some(Err(_)) => true,
                None => false,
            };
            if !touches {
                writer.add_range(descriptor)?;
                continue;
            }

            let mut merged = Vec::with_capacity(descriptor.count as usize);
            let mut local = ApplySummary::default();
            let mut existing = self.ranges.read_range(namespace, &descriptor.id)?.peekable();
            loop {
                let change = next_if_at_most(&mut changes, descriptor.max_key.as_str())?;
                let Some(change) = change else {
                    merged.extend(existing.by_ref());
                    break;
                };
                while let Some(record) = existing.next_if(|r| r.key < change.key) {
                    merged.push(record);
                }
                let current = existing.next_if(|r| r.key == change.key);
                match (current, change.value) {
                    (Some(_), None) => local.removed += 1,
                    (Some(record), Some(entry)) => {
                        if same_value(Some(&record.entry), Some(&entry)) {
                            merged.push(record);
                        } else {
                            local.changed += 1;
                            merged.push(Record::new(change.key, entry));
                        }
                    }
                    (None, Some(entry)) => {
                        local.added += 1;
                        merged.push(Record::new(change.key, entry));
                    }
                    (None, None) => {}
                }
            }

            if local.is_empty() {
                writer.add_range(descriptor)?;
            } else {
                for record in merged {
                    writer.add_record(record)?;
                }
                summary.added += local.added;
                summary.changed += local.changed;
                summary.removed += local.removed;
            }
        }

        for change in changes {
            let change = change?;
            if let Some(entry) = change.value {
                writer.add_record(Record::new(change.key, entry))?;
                summary.added += 1;
            }
        }

        let id = writer.finish()?;
        debug!(base = %base, metarange_id = %id, ?summary, "applied changes");
        Ok((id, summary))
    }
}

/// Pop the next change if its key is strictly below `bound`.
fn next_if_before<I>(changes: &mut Peekable<I>, bound: &str) -> Result<Option<Change>>
where
    I: Iterator<Item = Result<Change>>,
{
    match changes.peek() {
        Some(Ok(change)) if change.key.as_str() < bound => changes.next().transpose(),
        Some(Err(_)) => changes.next().transpose(),
        _ => Ok(None),
    }
}

/// Pop the next change if its key is at most `bound`.
fn next_if_at_most<I>(changes: &mut Peekable<I>, bound: &str) -> Result<Option<Change>>
where
    I: Iterator<Item = Result<Change>>,
{
    match changes.peek() {
        Some(Ok(change)) if change.key.as_str() <= bound => changes.next().transpose(),
        Some(Err(_)) => changes.next().transpose(),
        _ => Ok(None),
    }
}

/// Rejects change streams that are not strictly ascending.
struct OrderedChanges<I> {
    inner: I,
    last: Option<Key>,
}

impl<I> OrderedChanges<I> {
    fn new(inner: I) -> Self {
        Self { inner, last: None }
    }
}

impl<I: Iterator<Item = Result<Change>>> Iterator for OrderedChanges<I> {
    type Item = Result<Change>;

    fn next(&mut self) -> Option<Self::Item> {
        let change = match self.inner.next()? {
            Ok(change) => change,
            Err(e) => return Some(Err(e)),
        };
        if let Some(previous) = &self.last {
            if change.key <= *previous {
                return Some(Err(Error::OrderingViolation {
                    previous: previous.to_string(),
                    key: change.key.to_string(),
                }));
            }
        }
        self.last = Some(change.key.clone());
        Some(Ok(change))
    }
}

/// Builds a metarange from a mix of single records and whole existing ranges.
pub struct MetaRangeWriter {
    manager: MetaRangeManager,
    namespace: String,
    records: RangeWriter,
    descriptors: Vec<RangeDescriptor>,
    last_key: Option<Key>,
}

impl MetaRangeWriter {
    fn check_after(&self, key: &Key) -> Result<()> {
        match &self.last_key {
            Some(previous) if key <= previous => Err(Error::OrderingViolation {
                previous: previous.to_string(),
                key: key.to_string(),
            }),
            _ => Ok(()),
        }
    }

    pub fn add_record(&mut self, record: Record) -> Result<()> {
        self.check_after(&record.key)?;
        self.last_key = Some(record.key.clone());
        if let Some(descriptor) = self.records.add(record)? {
            self.descriptors.push(descriptor);
        }
        Ok(())
    }

    /// Reuse an existing range as is; buffered records are cut first.
    pub fn add_range(&mut self, descriptor: RangeDescriptor) -> Result<()> {
        self.check_after(&descriptor.min_key)?;
        if let Some(flushed) = self.records.flush()? {
            self.descriptors.push(flushed);
        }
        self.last_key = Some(descriptor.max_key.clone());
        self.descriptors.push(descriptor);
        Ok(())
    }

    pub fn finish(mut self) -> Result<MetaRangeId> {
        if let Some(flushed) = self.records.flush()? {
            self.descriptors.push(flushed);
        }
        self.manager.write_metarange(&self.namespace, self.descriptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::committed::range::RangeConfig;
    use crate::committed::RecordIterator;
    use crate::storage::{Entry, MemoryBlobStore};

    const NS: &str = "mem://repo";

    fn manager(target_entries: usize) -> MetaRangeManager {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let config = RangeConfig {
            target_entries,
            ..RangeConfig::default()
        };
        let ranges = RangeManager::new(store.clone(), "_data", config);
        MetaRangeManager::new(store, "_data", ranges)
    }

    fn record(key: &str, addr: &str) -> Record {
        Record::new(Key::new(key).unwrap(), Entry::new(addr, 1, "c"))
    }

    fn set(key: &str, addr: &str) -> Result<Change> {
        Ok(Change::set(Key::new(key).unwrap(), Entry::new(addr, 1, "c")))
    }

    fn delete(key: &str) -> Result<Change> {
        Ok(Change::delete(Key::new(key).unwrap()))
    }

    fn keys(manager: &MetaRangeManager, id: &MetaRangeId) -> Vec<String> {
        manager
            .entries(NS, id)
            .unwrap()
            .map(|r| r.unwrap().key.into_string())
            .collect()
    }

    #[test]
    fn test_round_trip_preserves_order() {
        let manager = manager(3);
        let records: Vec<Record> = (0..10).map(|i| record(&format!("k{:02}", i), "x")).collect();
        let id = manager.write_records(NS, records.clone()).unwrap();
        assert_eq!(manager.read_metarange(NS, &id).unwrap().len(), 4);

        let read: Vec<Record> = manager.entries(NS, &id).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(read, records);
    }

    #[test]
    fn test_overlapping_ranges_rejected() {
        let manager = manager(10);
        let a = manager.ranges().write_range(NS, vec![record("a", "1"), record("c", "2")]).unwrap();
        let b = manager.ranges().write_range(NS, vec![record("b", "3")]).unwrap();
        let err = manager.write_metarange(NS, vec![a[0].clone(), b[0].clone()]).unwrap_err();
        assert!(matches!(err, Error::OrderingViolation { .. }));
    }

    #[test]
    fn test_seek_skips_ranges() {
        let manager = manager(2);
        let id = manager
            .write_records(NS, ["a", "b", "c", "d", "e"].iter().map(|k| record(k, "x")))
            .unwrap();
        let mut iter = manager.entries(NS, &id).unwrap();
        iter.seek_ge("c").unwrap();
        assert_eq!(iter.next().unwrap().unwrap().key.as_str(), "c");
        iter.seek_ge("e").unwrap();
        assert_eq!(iter.next().unwrap().unwrap().key.as_str(), "e");
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_apply_counts_effective_changes() {
        let manager = manager(100);
        let a = record("a", "1");
        let b = record("b", "2");
        let base = manager.write_records(NS, vec![a.clone(), b.clone()]).unwrap();

        let changes = vec![
            Ok(Change::set(a.key.clone(), a.entry.clone())), // identical
            delete("aa"),                                   // absent
            set("b", "3"),
            set("c", "4"),
        ];
        let (id, summary) = manager
            .apply(NS, &base, changes.into_iter(), &CancelFlag::new())
            .unwrap();
        assert_eq!(summary, ApplySummary { added: 1, changed: 1, removed: 0 });
        assert_eq!(keys(&manager, &id), vec!["a", "b", "c"]);

        let (id, summary) = manager
            .apply(NS, &id, vec![delete("a")].into_iter(), &CancelFlag::new())
            .unwrap();
        assert_eq!(summary.removed, 1);
        assert_eq!(keys(&manager, &id), vec!["b", "c"]);
    }

    #[test]
    fn test_apply_reuses_untouched_ranges() {
        let manager = manager(3);
        let records: Vec<Record> = (0..9).map(|i| record(&format!("k{}", i), "x")).collect();
        let base = manager.write_records(NS, records).unwrap();
        let before = manager.read_metarange(NS, &base).unwrap();
        assert_eq!(before.len(), 3);

        let (id, _) = manager
            .apply(NS, &base, vec![set("k4", "changed")].into_iter(), &CancelFlag::new())
            .unwrap();
        let after = manager.read_metarange(NS, &id).unwrap();
        assert_eq!(after.len(), 3);
        assert_eq!(after[0].id, before[0].id);
        assert_ne!(after[1].id, before[1].id);
        assert_eq!(after[2].id, before[2].id);
    }

    #[test]
    fn test_apply_no_effective_change_keeps_id() {
        let manager = manager(2);
        let records: Vec<Record> = ["a", "b", "c"].iter().map(|k| record(k, "x")).collect();
        let base = manager.write_records(NS, records.clone()).unwrap();
        let changes = vec![Ok(Change::set(records[1].key.clone(), records[1].entry.clone())), delete("bb")];
        let (id, summary) = manager.apply(NS, &base, changes.into_iter(), &CancelFlag::new()).unwrap();
        assert!(summary.is_empty());
        assert_eq!(id, base);
    }

    #[test]
    fn test_apply_rejects_unsorted_changes() {
        let manager = manager(10);
        let base = manager.write_empty(NS).unwrap();
        let err = manager
            .apply(NS, &base, vec![set("b", "1"), set("a", "2")].into_iter(), &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, Error::OrderingViolation { .. }));
    }

    #[test]
    fn test_apply_cancelled() {
        let manager = manager(10);
        let base = manager.write_records(NS, vec![record("a", "1")]).unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = manager.apply(NS, &base, vec![set("b", "1")].into_iter(), &cancel).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_get_entry_and_list() {
        let manager = manager(2);
        let id = manager
            .write_records(NS, ["a/1", "a/2", "b/1", "c"].iter().map(|k| record(k, "x")))
            .unwrap();
        assert!(manager.get_entry(NS, &id, "b/1").unwrap().is_some());
        assert!(manager.get_entry(NS, &id, "b/2").unwrap().is_none());

        let listing = manager
            .list_entries(NS, &id, &ListOptions::default().delimiter("/"))
            .unwrap();
        let paths: Vec<&str> = listing.iter().map(Listing::path).collect();
        assert_eq!(paths, vec!["a/", "b/", "c"]);
    }
}
