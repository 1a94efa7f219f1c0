//! Column families.
//!
//! Each column family has its own memtables, slot pool and file sets. Frozen
//! memtables wait in a queue until a flush picks them up; the flush marks
//! them in flight under its generation and removes them once its file is
//! installed.

use crate::error::{Error, Result};
use crate::flush::blob::BlobFileAddition;
use crate::flush::ValidatorDigest;
use crate::memtable::MemTable;
use crate::slots::{SlotAllocator, SlotHandle};
use crate::sstable::FileIdentity;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Id of the column family every node has.
pub const DEFAULT_COLUMN_FAMILY: u32 = 0;

/// Name of the default column family.
pub const DEFAULT_COLUMN_FAMILY_NAME: &str = "default";

/// Flush progress of a frozen memtable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    /// Waiting for a flush.
    Pending,
    /// Being flushed by the given generation.
    InFlight(u64),
}

/// A table file owned by a column family.
#[derive(Debug, Clone)]
pub struct LiveFile {
    /// Identity of the file.
    pub identity: FileIdentity,
    /// Generation that produced the file.
    pub generation: u64,
    /// Digest of the entries written, when this node built the file.
    pub digest: Option<ValidatorDigest>,
    /// Blob file written alongside the table.
    pub blob: Option<BlobFileAddition>,
    /// Whether the tail of the chain holds the file.
    pub chain_durable: bool,
}

/// Memtables picked up by one flush, with the slot of their generation.
#[derive(Debug)]
pub struct PickedFlush {
    /// Slot reserved for the generation.
    pub handle: SlotHandle,
    /// Memtables to flush, oldest first.
    pub memtables: Vec<Arc<MemTable>>,
}

#[derive(Debug, Default)]
struct FileSet {
    live: BTreeMap<u64, LiveFile>,
    flagged: BTreeMap<u64, LiveFile>,
}

/// One column family of a node.
pub struct ColumnFamily {
    id: u32,
    name: String,
    memtable: RwLock<Arc<MemTable>>,
    immutables: Mutex<VecDeque<(Arc<MemTable>, FlushState)>>,
    slots: SlotAllocator,
    files: RwLock<FileSet>,
}

impl ColumnFamily {
    /// Creates a column family with an empty memtable.
    pub fn new(id: u32, name: impl Into<String>, slots: SlotAllocator, memtable_id: u64) -> Self {
        Self {
            id,
            name: name.into(),
            memtable: RwLock::new(Arc::new(MemTable::new(memtable_id))),
            immutables: Mutex::new(VecDeque::new()),
            slots,
            files: RwLock::new(FileSet::default()),
        }
    }

    /// Id of the column family.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Name of the column family.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Slot pool of the column family.
    pub fn slots(&self) -> &SlotAllocator {
        &self.slots
    }

    /// The memtable taking writes.
    pub fn active(&self) -> Arc<MemTable> {
        Arc::clone(&self.memtable.read())
    }

    /// Runs `f` against the active memtable. A freeze waits for `f` to
    /// return, so a write never lands in a memtable that is being flushed.
    pub fn write<R>(&self, f: impl FnOnce(&MemTable) -> R) -> R {
        f(&self.memtable.read())
    }

    /// Freezes the active memtable once it holds at least `limit` bytes.
    pub fn freeze_if_full(&self, next_memtable_id: u64, limit: usize) -> bool {
        if self.memtable.read().approximate_size() < limit {
            return false;
        }
        let mut memtable = self.memtable.write();
        if memtable.approximate_size() < limit {
            return false;
        }
        let old = std::mem::replace(&mut *memtable, Arc::new(MemTable::new(next_memtable_id)));
        self.immutables.lock().push_back((old, FlushState::Pending));
        log::info!("MemTable of cf {} is full ({} bytes), frozen", self.name, limit);
        true
    }

    /// Moves the active memtable to the flush queue and starts a new one.
    ///
    /// An empty memtable is only frozen with `force`, which lets a flush
    /// request with no data still run (and produce no file).
    pub fn freeze(&self, next_memtable_id: u64, force: bool) -> bool {
        let mut memtable = self.memtable.write();
        if memtable.is_empty() && !force {
            return false;
        }
        let old = std::mem::replace(&mut *memtable, Arc::new(MemTable::new(next_memtable_id)));
        let mut immutables = self.immutables.lock();
        immutables.push_back((old, FlushState::Pending));
        log::info!(
            "MemTable of cf {} frozen, {} immutable memtables waiting for flush",
            self.name,
            immutables.len()
        );
        true
    }

    /// Memtables (active plus frozen) held in memory.
    pub fn memtable_count(&self) -> usize {
        1 + self.immutables.lock().len()
    }

    /// Frozen memtables not yet picked by a flush.
    pub fn pending_count(&self) -> usize {
        self.immutables.lock().iter().filter(|(_, s)| *s == FlushState::Pending).count()
    }

    /// Picks every pending memtable and reserves the slot of the next
    /// generation for them. Generation order therefore follows memtable order.
    ///
    /// Returns `None` when nothing is pending. If the reservation fails the
    /// memtables stay pending. Waiting for a busy slot happens without the
    /// memtable queue locked, so writers and other flushes keep going.
    pub fn begin_flush(&self) -> Result<Option<PickedFlush>> {
        let deadline = self.slots.deadline();
        loop {
            {
                let mut immutables = self.immutables.lock();
                if !immutables.iter().any(|(_, s)| *s == FlushState::Pending) {
                    return Ok(None);
                }

                match self.slots.try_reserve_next() {
                    Ok(handle) => {
                        let mut memtables = Vec::new();
                        for (memtable, state) in immutables.iter_mut() {
                            if *state == FlushState::Pending {
                                *state = FlushState::InFlight(handle.generation);
                                memtables.push(Arc::clone(memtable));
                            }
                        }
                        return Ok(Some(PickedFlush { handle, memtables }));
                    }
                    Err(Error::PoolExhausted(_)) if deadline.is_some() => {}
                    Err(e) => return Err(e),
                }
            }
            log::debug!("cf {} waits for a free slot", self.name);
            self.slots.wait_for_next_slot(deadline)?;
        }
    }

    /// Drops the memtables flushed by `generation`.
    pub fn finish_flush(&self, generation: u64) {
        self.immutables.lock().retain(|(_, s)| *s != FlushState::InFlight(generation));
    }

    /// Returns the memtables of a failed `generation` to the pending state.
    pub fn abort_flush(&self, generation: u64) {
        for (_, state) in self.immutables.lock().iter_mut() {
            if *state == FlushState::InFlight(generation) {
                *state = FlushState::Pending;
            }
        }
    }

    /// Adds a file to the live set.
    pub fn install_file(&self, file: LiveFile) {
        let mut files = self.files.write();
        files.flagged.remove(&file.identity.file_number);
        files.live.insert(file.identity.file_number, file);
    }

    /// Moves a file into the flagged set, out of the live set.
    pub fn flag_file(&self, file: LiveFile) {
        log::warn!("File {} of cf {} flagged for inspection", file.identity.file_number, self.name);
        let mut files = self.files.write();
        files.live.remove(&file.identity.file_number);
        files.flagged.insert(file.identity.file_number, file);
    }

    /// Marks a live file as held by the chain tail.
    pub fn mark_chain_durable(&self, file_number: u64) {
        if let Some(file) = self.files.write().live.get_mut(&file_number) {
            file.chain_durable = true;
        }
    }

    /// Removes a file from the live or flagged set.
    pub fn remove_file(&self, file_number: u64) -> Option<LiveFile> {
        let mut files = self.files.write();
        files.live.remove(&file_number).or_else(|| files.flagged.remove(&file_number))
    }

    /// Looks up a live or flagged file.
    pub fn file(&self, file_number: u64) -> Option<LiveFile> {
        let files = self.files.read();
        files.live.get(&file_number).or_else(|| files.flagged.get(&file_number)).cloned()
    }

    /// Returns true if the file is in the flagged set.
    pub fn is_flagged(&self, file_number: u64) -> bool {
        self.files.read().flagged.contains_key(&file_number)
    }

    /// Live files in generation order.
    pub fn live_files(&self) -> Vec<LiveFile> {
        let mut files: Vec<_> = self.files.read().live.values().cloned().collect();
        files.sort_by_key(|f| f.generation);
        files
    }

    /// Flagged files in generation order.
    pub fn flagged_files(&self) -> Vec<LiveFile> {
        let mut files: Vec<_> = self.files.read().flagged.values().cloned().collect();
        files.sort_by_key(|f| f.generation);
        files
    }

    /// Largest sequence number stored in any file.
    pub fn largest_file_sequence(&self) -> u64 {
        let files = self.files.read();
        files
            .live
            .values()
            .chain(files.flagged.values())
            .map(|f| f.identity.largest_seqno)
            .max()
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for ColumnFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnFamily")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("memtables", &self.memtable_count())
            .field("slots", &self.slots)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExhaustionPolicy;
    use std::time::{Duration, Instant};

    fn column_family(pool_size: usize) -> ColumnFamily {
        ColumnFamily::new(0, "default", SlotAllocator::new(0, pool_size, ExhaustionPolicy::FailFast, None), 1)
    }

    #[test]
    fn test_freeze_skips_empty_memtable() {
        let cf = column_family(4);
        assert!(!cf.freeze(2, false));
        cf.active().put(b"k", b"v", 1);
        assert!(cf.freeze(2, false));
        assert_eq!(cf.active().id(), 2);
        assert_eq!(cf.memtable_count(), 2);
        assert!(cf.freeze(3, true));
        assert_eq!(cf.pending_count(), 2);
    }

    #[test]
    fn test_freeze_if_full() {
        let cf = column_family(4);
        cf.write(|m| m.put(b"key", b"value", 1));
        assert!(!cf.freeze_if_full(2, 1024));
        assert!(cf.freeze_if_full(2, 1));
        assert_eq!(cf.pending_count(), 1);
        assert!(!cf.freeze_if_full(3, 1));
    }

    #[test]
    fn test_flush_lifecycle() {
        let cf = column_family(4);
        cf.active().put(b"a", b"1", 1);
        cf.freeze(2, false);
        cf.active().put(b"b", b"2", 2);
        cf.freeze(3, false);

        let picked = cf.begin_flush().unwrap().unwrap();
        assert_eq!(picked.handle.generation, 0);
        assert_eq!(picked.memtables.len(), 2);
        assert_eq!(picked.memtables[0].id(), 1);
        assert!(cf.begin_flush().unwrap().is_none());

        cf.abort_flush(0);
        assert_eq!(cf.pending_count(), 2);
        cf.slots().release(&picked.handle).unwrap();

        let retry = cf.begin_flush().unwrap().unwrap();
        assert_eq!(retry.handle.generation, 1);
        assert_eq!(retry.memtables.len(), 2);
        cf.finish_flush(retry.handle.generation);
        assert_eq!(cf.memtable_count(), 1);
    }

    #[test]
    fn test_slot_wait_does_not_block_writers() {
        let cf = ColumnFamily::new(
            0,
            "default",
            SlotAllocator::new(0, 1, ExhaustionPolicy::Block { timeout: Duration::from_secs(5) }, None),
            1,
        );
        cf.active().put(b"a", b"1", 1);
        cf.freeze(2, false);
        let first = cf.begin_flush().unwrap().unwrap();
        cf.active().put(b"b", b"2", 2);
        cf.freeze(3, false);

        std::thread::scope(|s| {
            let waiter = s.spawn(|| cf.begin_flush());
            std::thread::sleep(Duration::from_millis(50));

            // The waiting flush holds no lock a writer or finishing flush needs.
            let start = Instant::now();
            cf.active().put(b"c", b"3", 3);
            assert!(cf.freeze(4, false));
            cf.finish_flush(first.handle.generation);
            assert!(start.elapsed() < Duration::from_secs(1));

            cf.slots().release(&first.handle).unwrap();
            let picked = waiter.join().unwrap().unwrap().unwrap();
            assert_eq!(picked.handle.generation, 1);
            assert_eq!(picked.memtables.len(), 2);
        });
    }

    #[test]
    fn test_slot_wait_times_out() {
        let cf = ColumnFamily::new(
            0,
            "default",
            SlotAllocator::new(0, 1, ExhaustionPolicy::Block { timeout: Duration::from_millis(50) }, None),
            1,
        );
        cf.active().put(b"a", b"1", 1);
        cf.freeze(2, false);
        let _first = cf.begin_flush().unwrap().unwrap();
        cf.active().put(b"b", b"2", 2);
        cf.freeze(3, false);

        assert!(matches!(cf.begin_flush(), Err(Error::PoolExhausted(_))));
        assert_eq!(cf.pending_count(), 1);
        assert_eq!(cf.slots().next_generation(), 1);
    }

    #[test]
    fn test_reservation_failure_keeps_memtables_pending() {
        let cf = column_family(1);
        cf.active().put(b"a", b"1", 1);
        cf.freeze(2, false);
        let first = cf.begin_flush().unwrap().unwrap();

        cf.active().put(b"b", b"2", 2);
        cf.freeze(3, false);
        assert!(cf.begin_flush().is_err());
        assert_eq!(cf.pending_count(), 1);
        assert_eq!(first.handle.generation, 0);
    }
}
