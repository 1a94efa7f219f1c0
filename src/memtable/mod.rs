//! # MemTable - In-Memory Sorted Table
//!
//! The MemTable stores recent writes in memory until a flush turns it into a
//! table file.
//!
//! ## Design
//!
//! - Based on crossbeam-skiplist for lock-free concurrent access
//! - Point deletes are tombstone entries; range deletes are kept aside
//! - Tracks size to determine when to freeze and flush

mod internal_key;

pub use internal_key::{compare_internal_keys, user_key_of, InternalKey, ValueType};

use crate::flush::range_del::RangeTombstone;
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Per-entry bookkeeping overhead counted towards the memtable size.
const ENTRY_OVERHEAD: usize = 16;

/// MemTable stores recent writes in memory using a SkipList.
///
/// # Example
///
/// ```rust
/// use chaindb::memtable::MemTable;
///
/// let memtable = MemTable::new(1);
/// memtable.put(b"key1", b"value1", 1);
/// memtable.delete_range(b"a", b"c", 2);
/// assert_eq!(memtable.len(), 1);
/// assert_eq!(memtable.range_tombstones().len(), 1);
/// ```
pub struct MemTable {
    id: u64,
    data: SkipMap<InternalKey, Vec<u8>>,
    range_tombstones: Mutex<Vec<RangeTombstone>>,
    size: AtomicUsize,
    largest_sequence: AtomicU64,
}

impl MemTable {
    /// Creates a new empty MemTable.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            data: SkipMap::new(),
            range_tombstones: Mutex::new(Vec::new()),
            size: AtomicUsize::new(0),
            largest_sequence: AtomicU64::new(0),
        }
    }

    /// Identifier of this memtable, increasing in creation order.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn record(&self, entry_size: usize, sequence: u64) {
        self.size.fetch_add(entry_size + ENTRY_OVERHEAD, Ordering::Relaxed);
        self.largest_sequence.fetch_max(sequence, Ordering::Relaxed);
    }

    /// Inserts a key-value pair.
    pub fn put(&self, key: &[u8], value: &[u8], sequence: u64) {
        let internal_key = InternalKey::new(key.to_vec(), sequence, ValueType::Value);
        self.data.insert(internal_key, value.to_vec());
        self.record(key.len() + value.len(), sequence);
    }

    /// Marks a key as deleted by inserting a tombstone.
    pub fn delete(&self, key: &[u8], sequence: u64) {
        let internal_key = InternalKey::new(key.to_vec(), sequence, ValueType::Deletion);
        self.data.insert(internal_key, Vec::new());
        self.record(key.len(), sequence);
    }

    /// Deletes every key in `[start, end)` written before `sequence`.
    pub fn delete_range(&self, start: &[u8], end: &[u8], sequence: u64) {
        self.range_tombstones.lock().push(RangeTombstone::new(start, end, sequence));
        self.record(start.len() + end.len(), sequence);
    }

    /// Range tombstones recorded in this memtable.
    pub fn range_tombstones(&self) -> Vec<RangeTombstone> {
        self.range_tombstones.lock().clone()
    }

    /// Returns the approximate size of the MemTable in bytes.
    pub fn approximate_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Largest sequence number written to this memtable.
    pub fn largest_sequence(&self) -> u64 {
        self.largest_sequence.load(Ordering::Relaxed)
    }

    /// Returns the number of point entries.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the MemTable holds neither entries nor range tombstones.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.range_tombstones.lock().is_empty()
    }

    /// Iterates the point entries in internal-key order.
    pub fn iter(&self) -> impl Iterator<Item = (InternalKey, Vec<u8>)> + '_ {
        self.data.iter().map(|entry| (entry.key().clone(), entry.value().clone()))
    }
}

impl std::fmt::Debug for MemTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTable")
            .field("id", &self.id)
            .field("entries", &self.len())
            .field("size", &self.approximate_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_memtable_new() {
        let memtable = MemTable::new(100);
        assert_eq!(memtable.id(), 100);
        assert!(memtable.is_empty());
        assert_eq!(memtable.len(), 0);
    }

    #[test]
    fn test_memtable_iterator_order() {
        let memtable = MemTable::new(1);

        memtable.put(b"key2", b"value2", 2);
        memtable.put(b"key1", b"old", 1);
        memtable.put(b"key1", b"new", 3);
        memtable.delete(b"key3", 4);

        let entries: Vec<_> = memtable.iter().collect();
        assert_eq!(entries.len(), 4);
        assert_eq!((entries[0].0.user_key(), entries[0].1.as_slice()), (&b"key1"[..], &b"new"[..]));
        assert_eq!(entries[1].0.sequence(), 1);
        assert_eq!(entries[2].0.user_key(), b"key2");
        assert_eq!(entries[3].0.value_type(), ValueType::Deletion);
        assert_eq!(memtable.largest_sequence(), 4);
    }

    #[test]
    fn test_memtable_range_delete() {
        let memtable = MemTable::new(1);
        memtable.delete_range(b"a", b"m", 7);

        assert!(!memtable.is_empty());
        assert_eq!(memtable.len(), 0);
        assert_eq!(memtable.range_tombstones(), vec![RangeTombstone::new(b"a".to_vec(), b"m".to_vec(), 7)]);
    }

    #[test]
    fn test_memtable_size() {
        let memtable = MemTable::new(1);
        assert_eq!(memtable.approximate_size(), 0);

        memtable.put(b"key1", b"value1", 1);
        let size_after_first = memtable.approximate_size();
        assert!(size_after_first > 0);

        memtable.delete(b"key2", 2);
        assert!(memtable.approximate_size() > size_after_first);
    }

    #[test]
    fn test_memtable_concurrent_writes() {
        use std::thread;

        let memtable = Arc::new(MemTable::new(1));
        let handles: Vec<_> = (0..10u64)
            .map(|i| {
                let mt = memtable.clone();
                thread::spawn(move || {
                    for j in 0..100u64 {
                        let key = format!("key{}", i * 100 + j);
                        mt.put(key.as_bytes(), b"v", i * 100 + j + 1);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(memtable.len(), 1000);
        assert_eq!(memtable.largest_sequence(), 1000);
        let keys: Vec<_> = memtable.iter().map(|(k, _)| k).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }
}
