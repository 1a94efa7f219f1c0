//! Range tombstones and their coverage during a flush.

use crate::error::{Error, Result};
use crate::memtable::{InternalKey, ValueType};

/// Deletes every user key in `[start, end)` written before `sequence`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeTombstone {
    /// First deleted user key.
    pub start: Vec<u8>,
    /// First user key past the range.
    pub end: Vec<u8>,
    /// Sequence number of the deletion.
    pub sequence: u64,
}

impl RangeTombstone {
    /// Creates a tombstone over `[start, end)`.
    pub fn new(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>, sequence: u64) -> Self {
        Self { start: start.into(), end: end.into(), sequence }
    }

    /// Returns true if the range holds no key.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Returns true if `user_key` lies in the range.
    pub fn contains(&self, user_key: &[u8]) -> bool {
        self.start.as_slice() <= user_key && user_key < self.end.as_slice()
    }

    /// Key under which the tombstone is stored: `start@sequence#RangeDeletion`.
    pub fn smallest_key(&self) -> InternalKey {
        InternalKey::new(self.start.clone(), self.sequence, ValueType::RangeDeletion)
    }

    /// Exclusive upper bound of the tombstone in internal-key order.
    pub fn largest_key(&self) -> InternalKey {
        InternalKey::new(self.end.clone(), u64::MAX, ValueType::RangeDeletion)
    }

    /// Serialized (key, value) pair as stored in the range-deletion block.
    pub fn encode(&self) -> (Vec<u8>, Vec<u8>) {
        (self.smallest_key().encode(), self.end.clone())
    }

    /// Parses a (key, value) pair read back from the range-deletion block.
    pub fn decode(key: &[u8], value: &[u8]) -> Result<Self> {
        let ikey = InternalKey::decode(key)
            .ok_or_else(|| Error::corruption("Malformed range tombstone key"))?;
        if ikey.value_type() != ValueType::RangeDeletion {
            return Err(Error::corruption("Range-deletion block holds a non-tombstone entry"));
        }
        Ok(Self::new(ikey.user_key().to_vec(), value.to_vec(), ikey.sequence()))
    }
}

/// Index of the snapshot stripe a sequence number belongs to.
///
/// `snapshots` must be sorted ascending. The stripe of `sequence` is the
/// position of the smallest snapshot `>= sequence`; `snapshots.len()` stands
/// for the latest state. Two versions in the same stripe are seen by exactly
/// the same snapshots.
pub fn stripe_of(snapshots: &[u64], sequence: u64) -> usize {
    snapshots.partition_point(|&s| s < sequence)
}

/// Tracks which range tombstones cover the record stream of a flush.
///
/// Records must be queried in ascending user-key order. A start-sorted cursor
/// over the tombstones advances alongside the records, keeping an active set
/// of ranges that contain the current key.
#[derive(Debug)]
pub struct RangeDelAggregator {
    tombstones: Vec<RangeTombstone>,
    snapshots: Vec<u64>,
    next: usize,
    active: Vec<usize>,
}

impl RangeDelAggregator {
    /// Creates an aggregator over `tombstones` for the given snapshot list.
    pub fn new(mut tombstones: Vec<RangeTombstone>, mut snapshots: Vec<u64>) -> Self {
        tombstones.retain(|t| !t.is_empty());
        tombstones.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| b.sequence.cmp(&a.sequence)));
        snapshots.sort_unstable();
        snapshots.dedup();
        Self { tombstones, snapshots, next: 0, active: Vec::new() }
    }

    /// Returns true if a newer tombstone in the same snapshot stripe covers `key`.
    pub fn should_delete(&mut self, key: &InternalKey) -> bool {
        let user_key = key.user_key();

        while self.next < self.tombstones.len()
            && self.tombstones[self.next].start.as_slice() <= user_key
        {
            self.active.push(self.next);
            self.next += 1;
        }
        let tombstones = &self.tombstones;
        self.active.retain(|&i| user_key < tombstones[i].end.as_slice());

        let stripe = stripe_of(&self.snapshots, key.sequence());
        self.active.iter().any(|&i| {
            let t = &self.tombstones[i];
            t.sequence > key.sequence() && stripe_of(&self.snapshots, t.sequence) == stripe
        })
    }

    /// Number of tombstones carried by this flush.
    pub fn len(&self) -> usize {
        self.tombstones.len()
    }

    /// Returns true if the flush carries no tombstones.
    pub fn is_empty(&self) -> bool {
        self.tombstones.is_empty()
    }

    /// The tombstones, sorted by start key.
    pub fn into_tombstones(self) -> Vec<RangeTombstone> {
        self.tombstones
    }
}
