//! Snapshots.
//!
//! A snapshot pins a sequence number. While it is alive, flushes keep the
//! newest version of every key at or below that sequence, so a later reader
//! of the table files still sees the data as it was when the snapshot was
//! taken.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Live snapshots of a node, counted per sequence number.
#[derive(Debug, Default)]
pub struct SnapshotList {
    live: Mutex<BTreeMap<u64, usize>>,
}

impl SnapshotList {
    /// Creates an empty list.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pins `sequence` until the returned snapshot is dropped.
    pub fn acquire(self: &Arc<Self>, sequence: u64) -> Snapshot {
        *self.live.lock().entry(sequence).or_insert(0) += 1;
        Snapshot { list: Arc::clone(self), sequence }
    }

    fn release(&self, sequence: u64) {
        let mut live = self.live.lock();
        if let Some(count) = live.get_mut(&sequence) {
            *count -= 1;
            if *count == 0 {
                live.remove(&sequence);
            }
        }
    }

    /// Sorted, deduplicated sequence numbers of the live snapshots.
    pub fn sequences(&self) -> Vec<u64> {
        self.live.lock().keys().copied().collect()
    }

    /// Number of live snapshots.
    pub fn len(&self) -> usize {
        self.live.lock().values().sum()
    }

    /// Returns true if no snapshot is alive.
    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }
}

/// A point-in-time view pinned by sequence number.
///
/// # Example
///
/// ```rust
/// use chaindb::snapshot::SnapshotList;
///
/// let list = SnapshotList::new();
/// let snapshot = list.acquire(42);
/// assert_eq!(list.sequences(), vec![42]);
/// drop(snapshot);
/// assert!(list.is_empty());
/// ```
pub struct Snapshot {
    list: Arc<SnapshotList>,
    sequence: u64,
}

impl Snapshot {
    /// Returns the sequence number of this snapshot.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.list.release(self.sequence);
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot").field("sequence", &self.sequence).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiple_snapshots() {
        let list = SnapshotList::new();
        let s3 = list.acquire(3);
        let s1 = list.acquire(1);
        let s3b = list.acquire(3);

        assert_eq!(list.sequences(), vec![1, 3]);
        assert_eq!(list.len(), 3);

        drop(s3);
        assert_eq!(list.sequences(), vec![1, 3]);
        drop(s3b);
        assert_eq!(list.sequences(), vec![1]);
        assert_eq!(s1.sequence(), 1);
        drop(s1);
        assert!(list.is_empty());
    }
}
