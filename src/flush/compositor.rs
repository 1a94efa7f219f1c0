//! Merge/tombstone compositor.
//!
//! Turns the memtables of one flush generation into the sequence of entries
//! that end up in the table file: a k-way merge over the memtables, then
//! snapshot-aware removal of superseded versions and of versions hidden by
//! range tombstones, with large values moved to the blob file on the way.

use crate::error::{Error, Result};
use crate::flush::blob::BlobFileBuilder;
use crate::flush::range_del::{stripe_of, RangeDelAggregator, RangeTombstone};
use crate::memtable::{InternalKey, MemTable, ValueType};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// One entry of a record stream.
pub type EntryResult = Result<(InternalKey, Vec<u8>)>;

/// A boxed record stream.
pub type EntrySource<'a> = Box<dyn Iterator<Item = EntryResult> + 'a>;

struct HeapEntry {
    key: InternalKey,
    value: Vec<u8>,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap; ties go to the lower source index
        other.key.cmp(&self.key).then_with(|| other.source.cmp(&self.source))
    }
}

/// K-way merge of sorted record streams into one stream in internal-key order.
///
/// An error from any source is yielded once and ends the merge.
pub struct MergingIterator<'a> {
    sources: Vec<EntrySource<'a>>,
    heap: BinaryHeap<HeapEntry>,
    pending_error: Option<Error>,
    primed: bool,
    failed: bool,
}

impl<'a> MergingIterator<'a> {
    /// Merges the given sources.
    pub fn new(sources: Vec<EntrySource<'a>>) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            pending_error: None,
            primed: false,
            failed: false,
        }
    }

    /// Merges the point entries of `memtables`.
    pub fn from_memtables(memtables: &'a [Arc<MemTable>]) -> Self {
        let sources = memtables
            .iter()
            .map(|m| Box::new(m.iter().map(Ok::<_, Error>)) as EntrySource<'a>)
            .collect();
        Self::new(sources)
    }

    fn pull(&mut self, source: usize) -> Result<()> {
        match self.sources[source].next() {
            Some(Ok((key, value))) => {
                self.heap.push(HeapEntry { key, value, source });
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => Ok(()),
        }
    }
}

impl Iterator for MergingIterator<'_> {
    type Item = EntryResult;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Some(e) = self.pending_error.take() {
            self.failed = true;
            return Some(Err(e));
        }
        if !self.primed {
            self.primed = true;
            for source in 0..self.sources.len() {
                if let Err(e) = self.pull(source) {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }

        let entry = self.heap.pop()?;
        if let Err(e) = self.pull(entry.source) {
            self.pending_error = Some(e);
        }
        Some(Ok((entry.key, entry.value)))
    }
}

/// Counters of one compositor run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompositorStats {
    /// Entries read from the input.
    pub input_entries: u64,
    /// Entries yielded.
    pub output_entries: u64,
    /// Entries dropped because a newer version lies in the same stripe.
    pub superseded: u64,
    /// Entries dropped because a range tombstone covers them.
    pub range_deleted: u64,
    /// Values moved to the blob file.
    pub blobs_written: u64,
}

/// Filters an ascending record stream into flush output.
///
/// An entry is dropped if a newer entry of the same user key lies in the same
/// snapshot stripe, or if a range tombstone with a larger sequence number in
/// the same stripe covers it. Point deletions are kept.
pub struct Compositor<'b, I> {
    input: I,
    range_del: RangeDelAggregator,
    snapshots: Vec<u64>,
    blob: Option<&'b mut BlobFileBuilder>,
    current_user_key: Option<Vec<u8>>,
    current_stripe: usize,
    stats: CompositorStats,
    done: bool,
}

impl<'b, I> Compositor<'b, I>
where
    I: Iterator<Item = EntryResult>,
{
    /// Creates a compositor over `input`.
    pub fn new(
        input: I,
        range_tombstones: Vec<RangeTombstone>,
        mut snapshots: Vec<u64>,
        blob: Option<&'b mut BlobFileBuilder>,
    ) -> Self {
        snapshots.sort_unstable();
        snapshots.dedup();
        Self {
            input,
            range_del: RangeDelAggregator::new(range_tombstones, snapshots.clone()),
            snapshots,
            blob,
            current_user_key: None,
            current_stripe: 0,
            stats: CompositorStats::default(),
            done: false,
        }
    }

    /// Counters so far.
    pub fn stats(&self) -> CompositorStats {
        self.stats
    }

    /// Ends the run, returning the range tombstones to store after the
    /// entries, sorted by start key.
    pub fn finish(self) -> (Vec<RangeTombstone>, CompositorStats) {
        (self.range_del.into_tombstones(), self.stats)
    }

    /// Returns true if `key` is hidden by a newer version of the same user key.
    fn superseded(&mut self, key: &InternalKey) -> bool {
        let stripe = stripe_of(&self.snapshots, key.sequence());
        let same_key = self.current_user_key.as_deref() == Some(key.user_key());
        let hidden = same_key && stripe == self.current_stripe;
        if !same_key {
            self.current_user_key = Some(key.user_key().to_vec());
        }
        self.current_stripe = stripe;
        hidden
    }

    fn externalize(&mut self, key: InternalKey, value: Vec<u8>) -> EntryResult {
        let Some(blob) = self.blob.as_deref_mut() else {
            return Ok((key, value));
        };
        if key.value_type() != ValueType::Value || !blob.wants(&value) {
            return Ok((key, value));
        }
        let index = blob.add(key.user_key(), &value)?;
        self.stats.blobs_written += 1;
        let blob_key = InternalKey::new(key.user_key().to_vec(), key.sequence(), ValueType::BlobIndex);
        Ok((blob_key, index.encode()))
    }
}

impl<I> Iterator for Compositor<'_, I>
where
    I: Iterator<Item = EntryResult>,
{
    type Item = EntryResult;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let (key, value) = match self.input.next() {
                None => {
                    self.done = true;
                    return None;
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(match e {
                        Error::InputIterator(msg) => Error::InputIterator(msg),
                        other => Error::InputIterator(other.to_string()),
                    }));
                }
                Some(Ok(entry)) => entry,
            };
            self.stats.input_entries += 1;

            if self.superseded(&key) {
                self.stats.superseded += 1;
                continue;
            }
            if self.range_del.should_delete(&key) {
                self.stats.range_deleted += 1;
                continue;
            }

            let out = self.externalize(key, value);
            if out.is_err() {
                self.done = true;
            } else {
                self.stats.output_entries += 1;
            }
            return Some(out);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(user: &str, seq: u64, vt: ValueType, value: &str) -> EntryResult {
        Ok((InternalKey::new(user.as_bytes().to_vec(), seq, vt), value.as_bytes().to_vec()))
    }

    fn compose(
        input: Vec<EntryResult>,
        tombstones: Vec<RangeTombstone>,
        snapshots: Vec<u64>,
    ) -> Vec<(String, u64)> {
        Compositor::new(input.into_iter(), tombstones, snapshots, None)
            .map(|r| {
                let (k, _) = r.unwrap();
                (String::from_utf8(k.user_key().to_vec()).unwrap(), k.sequence())
            })
            .collect()
    }

    #[test]
    fn test_merging_iterator_orders_memtables() {
        let older = Arc::new(MemTable::new(1));
        older.put(b"a", b"1", 1);
        older.put(b"c", b"3", 2);
        let newer = Arc::new(MemTable::new(2));
        newer.put(b"b", b"2", 3);
        newer.put(b"a", b"4", 4);

        let memtables = vec![older, newer];
        let merged: Vec<_> = MergingIterator::from_memtables(&memtables)
            .map(|r| {
                let (k, _) = r.unwrap();
                (k.user_key().to_vec(), k.sequence())
            })
            .collect();

        assert_eq!(
            merged,
            vec![(b"a".to_vec(), 4), (b"a".to_vec(), 1), (b"b".to_vec(), 3), (b"c".to_vec(), 2)]
        );
    }

    #[test]
    fn test_merging_iterator_stops_on_error() {
        let bad: EntrySource = Box::new(
            vec![entry("a", 1, ValueType::Value, "x"), Err(Error::corruption("bad block"))].into_iter(),
        );
        let good: EntrySource = Box::new(vec![entry("b", 2, ValueType::Value, "y")].into_iter());

        let results: Vec<_> = MergingIterator::new(vec![bad, good]).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn test_superseded_versions_dropped() {
        let input = vec![
            entry("a", 9, ValueType::Value, "new"),
            entry("a", 5, ValueType::Value, "old"),
            entry("b", 3, ValueType::Deletion, ""),
            entry("b", 2, ValueType::Value, "gone"),
        ];
        assert_eq!(compose(input, vec![], vec![]), vec![("a".into(), 9), ("b".into(), 3)]);
    }

    #[test]
    fn test_snapshot_keeps_visible_version() {
        let input = vec![
            entry("a", 9, ValueType::Value, "new"),
            entry("a", 5, ValueType::Value, "snap"),
            entry("a", 4, ValueType::Value, "old"),
        ];
        // Snapshot 6 sees a@5; a@4 is shadowed within the same stripe
        assert_eq!(compose(input, vec![], vec![6]), vec![("a".into(), 9), ("a".into(), 5)]);
    }

    #[test]
    fn test_range_tombstone_filters() {
        let input = vec![
            entry("a", 1, ValueType::Value, "keep"),
            entry("b", 2, ValueType::Value, "drop"),
            entry("c", 12, ValueType::Value, "newer"),
            entry("d", 3, ValueType::Value, "keep"),
        ];
        let tombstones = vec![RangeTombstone::new(b"b".to_vec(), b"d".to_vec(), 10)];

        let mut compositor = Compositor::new(input.into_iter(), tombstones.clone(), vec![], None);
        let keys: Vec<_> = compositor.by_ref().map(|r| r.unwrap().0.user_key().to_vec()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"c".to_vec(), b"d".to_vec()]);

        let (remaining, stats) = compositor.finish();
        assert_eq!(remaining, tombstones);
        assert_eq!(stats.range_deleted, 1);
        assert_eq!(stats.output_entries, 3);
    }

    #[test]
    fn test_input_error_surfaces() {
        let input = vec![entry("a", 1, ValueType::Value, "x"), Err(Error::corruption("bad block"))];
        let results: Vec<_> = Compositor::new(input.into_iter(), vec![], vec![], None).collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(results[1], Err(Error::InputIterator(_))));
    }

    #[test]
    fn test_large_values_go_to_blob_file() {
        let dir = TempDir::new().unwrap();
        let mut blob = BlobFileBuilder::new(dir.path(), 9, 8);
        let input = vec![
            entry("a", 1, ValueType::Value, "short"),
            entry("b", 2, ValueType::Value, "a rather long value"),
        ];

        let out: Vec<_> = Compositor::new(input.into_iter(), vec![], vec![], Some(&mut blob))
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(out[0].0.value_type(), ValueType::Value);
        assert_eq!(out[1].0.value_type(), ValueType::BlobIndex);

        assert!(blob.finish().unwrap().is_some());
        let index = crate::flush::blob::BlobIndex::decode(&out[1].1).unwrap();
        assert_eq!(crate::flush::blob::read_blob(dir.path(), &index).unwrap(), b"a rather long value");
    }
}
