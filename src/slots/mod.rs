//! Slot allocator.
//!
//! File numbers come from a fixed pool of slots per column family. A flush
//! generation maps to slot `generation % pool_size` in epoch
//! `generation / pool_size`, and slot `i` of column family `c` always carries
//! file number `c * pool_size + i + 1`. Every replica with the same pool size
//! therefore resolves a generation to the same file number.
//!
//! ```text
//!            reserve              commit               release
//!   Free ─────────────▶ Reserved ─────────▶ Committed ─────────▶ Free
//!                          │                                       ▲
//!                          └───────────── release ─────────────────┘
//! ```
//!
//! A slot still held by an older generation is never overwritten by a local
//! flush: `reserve` fails with `PoolExhausted` or waits, depending on
//! [`ExhaustionPolicy`]. Replicas are the exception. The upstream node only
//! reuses a slot after releasing it, so a shipped generation supersedes the
//! older committed file in its slot.

pub mod log;

pub use self::log::{SlotLog, SlotLogKind, SlotLogRecord};

use crate::config::ExhaustionPolicy;
use crate::error::{Error, Result};
use crate::sstable::FileIdentity;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Instant;

/// State of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Available for the next generation that maps to it.
    Free,
    /// Held by a running flush or install.
    Reserved {
        /// Generation holding the slot.
        generation: u64,
    },
    /// Holds a durable file.
    Committed {
        /// Generation that produced the file.
        generation: u64,
        /// Whether the next chain node acknowledged the file.
        acknowledged: bool,
    },
}

impl SlotState {
    fn generation(&self) -> Option<u64> {
        match *self {
            SlotState::Free => None,
            SlotState::Reserved { generation } | SlotState::Committed { generation, .. } => {
                Some(generation)
            }
        }
    }
}

/// A reserved or committed slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHandle {
    /// Column family owning the slot.
    pub cf_id: u32,
    /// Index of the slot in the pool.
    pub slot_index: usize,
    /// Generation holding the slot.
    pub generation: u64,
    /// Pool wraparound count of the generation.
    pub epoch: u64,
    /// File number of the slot.
    pub file_number: u64,
}

/// Result of reserving a slot for a file shipped from upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShippedReservation {
    /// The slot is reserved; install the file and commit.
    Reserved(SlotHandle),
    /// The generation is already committed with this file number.
    AlreadyInstalled(SlotHandle),
    /// The slot held a file of an older generation that upstream released.
    /// Its release is logged; delete `stale` and install the file.
    Superseded {
        /// The reservation for the shipped generation.
        reserved: SlotHandle,
        /// The released generation.
        stale: SlotHandle,
    },
}

struct Inner {
    slots: Vec<SlotState>,
    next_generation: u64,
}

/// Slot pool of one column family.
pub struct SlotAllocator {
    cf_id: u32,
    pool_size: usize,
    exhaustion: ExhaustionPolicy,
    inner: Mutex<Inner>,
    released: Condvar,
    log: Option<Arc<SlotLog>>,
}

impl SlotAllocator {
    /// Creates an allocator with `pool_size` free slots. Transitions are
    /// persisted to `log` when one is given.
    pub fn new(
        cf_id: u32,
        pool_size: usize,
        exhaustion: ExhaustionPolicy,
        log: Option<Arc<SlotLog>>,
    ) -> Self {
        Self {
            cf_id,
            pool_size,
            exhaustion,
            inner: Mutex::new(Inner { slots: vec![SlotState::Free; pool_size], next_generation: 0 }),
            released: Condvar::new(),
            log,
        }
    }

    /// Column family of this pool.
    pub fn cf_id(&self) -> u32 {
        self.cf_id
    }

    /// Number of slots.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// File number carried by slot `slot_index`.
    pub fn file_number_for(&self, slot_index: usize) -> u64 {
        self.cf_id as u64 * self.pool_size as u64 + slot_index as u64 + 1
    }

    /// Slot index and epoch of `generation`.
    pub fn locate(&self, generation: u64) -> (usize, u64) {
        let pool = self.pool_size as u64;
        ((generation % pool) as usize, generation / pool)
    }

    fn handle(&self, generation: u64) -> SlotHandle {
        let (slot_index, epoch) = self.locate(generation);
        SlotHandle {
            cf_id: self.cf_id,
            slot_index,
            generation,
            epoch,
            file_number: self.file_number_for(slot_index),
        }
    }

    /// Slot index of `file_number`, if it belongs to this pool.
    pub fn slot_of_file(&self, file_number: u64) -> Option<usize> {
        let first = self.file_number_for(0);
        if file_number < first {
            return None;
        }
        let index = (file_number - first) as usize;
        (index < self.pool_size).then_some(index)
    }

    /// Reserves the slot of `generation`.
    pub fn reserve(&self, generation: u64) -> Result<SlotHandle> {
        let mut inner = self.inner.lock();
        let handle = self.reserve_locked(&mut inner, generation, self.deadline())?;
        inner.next_generation = inner.next_generation.max(generation + 1);
        Ok(handle)
    }

    /// Assigns the next generation index and reserves its slot.
    pub fn reserve_next(&self) -> Result<SlotHandle> {
        self.reserve_next_until(self.deadline())
    }

    /// Like [`SlotAllocator::reserve_next`], but fails with `PoolExhausted`
    /// instead of waiting for the slot.
    pub fn try_reserve_next(&self) -> Result<SlotHandle> {
        self.reserve_next_until(None)
    }

    fn reserve_next_until(&self, deadline: Option<Instant>) -> Result<SlotHandle> {
        let mut inner = self.inner.lock();
        let generation = inner.next_generation;
        inner.next_generation = generation + 1;
        match self.reserve_locked(&mut inner, generation, deadline) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                if inner.next_generation == generation + 1 {
                    inner.next_generation = generation;
                }
                Err(e)
            }
        }
    }

    /// Reserves the slot for a file shipped from upstream.
    ///
    /// The upstream node assigned `file_number`; a mismatch with the locally
    /// computed file number means the chain has diverged.
    pub fn reserve_shipped(&self, generation: u64, file_number: u64) -> Result<ShippedReservation> {
        let handle = self.handle(generation);
        if handle.file_number != file_number {
            return Err(Error::corruption(format!(
                "cf {} generation {} maps to file {} but upstream shipped file {}",
                self.cf_id, generation, handle.file_number, file_number
            )));
        }

        let mut inner = self.inner.lock();
        let stale = match inner.slots[handle.slot_index] {
            SlotState::Committed { generation: g, .. } if g == generation => {
                return Ok(ShippedReservation::AlreadyInstalled(handle));
            }
            SlotState::Committed { generation: g, .. } if g < generation => {
                let stale = self.handle(g);
                self.persist(SlotLogKind::Release, &stale)?;
                inner.slots[handle.slot_index] = SlotState::Free;
                ::log::info!(
                    "Generation {} of cf {} supersedes generation {} in slot {} (file {})",
                    generation,
                    self.cf_id,
                    g,
                    handle.slot_index,
                    handle.file_number
                );
                Some(stale)
            }
            _ => None,
        };
        let handle = self.reserve_locked(&mut inner, generation, self.deadline())?;
        inner.next_generation = inner.next_generation.max(generation + 1);
        Ok(match stale {
            Some(stale) => ShippedReservation::Superseded { reserved: handle, stale },
            None => ShippedReservation::Reserved(handle),
        })
    }

    /// Waits until the slot of the next generation is free. Fails with
    /// `PoolExhausted` once `deadline` passes, or at once without one.
    pub fn wait_for_next_slot(&self, deadline: Option<Instant>) -> Result<()> {
        let mut inner = self.inner.lock();
        loop {
            let generation = inner.next_generation;
            let (slot_index, _) = self.locate(generation);
            let Some(holder) = inner.slots[slot_index].generation() else {
                return Ok(());
            };
            let timed_out = match deadline {
                Some(deadline) => self.released.wait_until(&mut inner, deadline).timed_out(),
                None => true,
            };
            if timed_out
                && inner.next_generation == generation
                && inner.slots[slot_index].generation() == Some(holder)
            {
                return Err(Error::PoolExhausted(format!(
                    "slot {} of cf {} still held by generation {}, needed by generation {}",
                    slot_index, self.cf_id, holder, generation
                )));
            }
        }
    }

    /// Deadline of a reservation starting now, per the exhaustion policy.
    pub fn deadline(&self) -> Option<Instant> {
        match self.exhaustion {
            ExhaustionPolicy::FailFast => None,
            ExhaustionPolicy::Block { timeout } => Some(Instant::now() + timeout),
        }
    }

    fn reserve_locked(
        &self,
        inner: &mut MutexGuard<'_, Inner>,
        generation: u64,
        deadline: Option<Instant>,
    ) -> Result<SlotHandle> {
        let handle = self.handle(generation);
        loop {
            let state = inner.slots[handle.slot_index];
            match state.generation() {
                None => {
                    inner.slots[handle.slot_index] = SlotState::Reserved { generation };
                    ::log::debug!(
                        "Reserved slot {} (file {}) of cf {} for generation {}",
                        handle.slot_index,
                        handle.file_number,
                        self.cf_id,
                        generation
                    );
                    return Ok(handle);
                }
                Some(g) if g == generation => {
                    return Err(Error::AlreadyExists(format!(
                        "generation {} of cf {} already holds slot {}",
                        generation, self.cf_id, handle.slot_index
                    )));
                }
                Some(g) if g > generation => {
                    return Err(Error::invalid_state(format!(
                        "generation {} of cf {} is older than generation {} holding slot {}",
                        generation, self.cf_id, g, handle.slot_index
                    )));
                }
                Some(g) => {
                    let exhausted = || {
                        Error::PoolExhausted(format!(
                            "slot {} of cf {} still held by generation {} ({:?}), needed by generation {}",
                            handle.slot_index, self.cf_id, g, state, generation
                        ))
                    };
                    let Some(deadline) = deadline else {
                        return Err(exhausted());
                    };
                    if self.released.wait_until(inner, deadline).timed_out()
                        && inner.slots[handle.slot_index].generation() == Some(g)
                    {
                        return Err(exhausted());
                    }
                }
            }
        }
    }

    /// Marks the reserved slot committed, after logging the transition.
    pub fn commit(&self, handle: &SlotHandle, identity: &FileIdentity) -> Result<()> {
        if identity.file_number != handle.file_number {
            return Err(Error::invalid_argument(format!(
                "file {} cannot be committed to slot {} (file {})",
                identity.file_number, handle.slot_index, handle.file_number
            )));
        }

        let mut inner = self.inner.lock();
        match inner.slots[handle.slot_index] {
            SlotState::Reserved { generation } if generation == handle.generation => {}
            other => {
                return Err(Error::invalid_state(format!(
                    "slot {} of cf {} is {:?}, not reserved by generation {}",
                    handle.slot_index, self.cf_id, other, handle.generation
                )))
            }
        }

        self.persist(SlotLogKind::Commit, handle)?;
        inner.slots[handle.slot_index] =
            SlotState::Committed { generation: handle.generation, acknowledged: false };
        Ok(())
    }

    /// Records that the next chain node acknowledged the committed file.
    pub fn acknowledge(&self, handle: &SlotHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.slots[handle.slot_index] {
            SlotState::Committed { generation, acknowledged } if generation == handle.generation => {
                if !acknowledged {
                    self.persist(SlotLogKind::Acknowledge, handle)?;
                    inner.slots[handle.slot_index] =
                        SlotState::Committed { generation, acknowledged: true };
                }
                Ok(())
            }
            other => Err(Error::invalid_state(format!(
                "slot {} of cf {} is {:?}, not committed by generation {}",
                handle.slot_index, self.cf_id, other, handle.generation
            ))),
        }
    }

    /// Frees a reserved or committed slot.
    pub fn release(&self, handle: &SlotHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.slots[handle.slot_index] {
            SlotState::Reserved { generation } if generation == handle.generation => {}
            SlotState::Committed { generation, .. } if generation == handle.generation => {
                self.persist(SlotLogKind::Release, handle)?;
            }
            other => {
                return Err(Error::invalid_state(format!(
                    "slot {} of cf {} is {:?}, not held by generation {}",
                    handle.slot_index, self.cf_id, other, handle.generation
                )))
            }
        }
        inner.slots[handle.slot_index] = SlotState::Free;
        drop(inner);
        self.released.notify_all();
        Ok(())
    }

    /// Frees the committed slot holding `file_number`, returning its handle.
    pub fn release_file(&self, file_number: u64) -> Result<SlotHandle> {
        let slot_index = self.slot_of_file(file_number).ok_or_else(|| {
            Error::not_found(format!("file {} is not in the pool of cf {}", file_number, self.cf_id))
        })?;
        let handle = match self.inner.lock().slots[slot_index] {
            SlotState::Committed { generation, .. } => self.handle(generation),
            other => {
                return Err(Error::not_found(format!(
                    "file {} is not committed (slot {} is {:?})",
                    file_number, slot_index, other
                )))
            }
        };
        self.release(&handle)?;
        Ok(handle)
    }

    fn persist(&self, kind: SlotLogKind, handle: &SlotHandle) -> Result<()> {
        match &self.log {
            Some(log) => log.append(&SlotLogRecord {
                kind,
                cf_id: self.cf_id,
                slot_index: handle.slot_index as u64,
                file_number: handle.file_number,
                generation: handle.generation,
                epoch: handle.epoch,
            }),
            None => Ok(()),
        }
    }

    /// Rebuilds slot states from recovery log records. Records of other
    /// column families are ignored.
    pub fn recover(&self, records: &[SlotLogRecord]) -> Result<()> {
        let mut inner = self.inner.lock();
        for record in records.iter().filter(|r| r.cf_id == self.cf_id) {
            let slot_index = record.slot_index as usize;
            if slot_index >= self.pool_size || record.file_number != self.file_number_for(slot_index) {
                return Err(Error::corruption(format!(
                    "slot log record {:?} does not fit a pool of {} slots",
                    record, self.pool_size
                )));
            }
            if self.locate(record.generation) != (slot_index, record.epoch) {
                return Err(Error::corruption(format!(
                    "slot log record {:?} has an inconsistent generation",
                    record
                )));
            }

            let slot = &mut inner.slots[slot_index];
            match record.kind {
                SlotLogKind::Commit => {
                    *slot = SlotState::Committed { generation: record.generation, acknowledged: false }
                }
                SlotLogKind::Acknowledge => {
                    if slot.generation() == Some(record.generation) {
                        *slot = SlotState::Committed { generation: record.generation, acknowledged: true };
                    }
                }
                SlotLogKind::Release => {
                    if slot.generation() == Some(record.generation) {
                        *slot = SlotState::Free;
                    }
                }
            }
            inner.next_generation = inner.next_generation.max(record.generation + 1);
        }
        Ok(())
    }

    /// Raises the next generation index to at least `generation`.
    pub fn advance_generation(&self, generation: u64) {
        let mut inner = self.inner.lock();
        inner.next_generation = inner.next_generation.max(generation);
    }

    /// Next generation index `reserve_next` would assign.
    pub fn next_generation(&self) -> u64 {
        self.inner.lock().next_generation
    }

    /// State of slot `slot_index`.
    pub fn state(&self, slot_index: usize) -> Option<SlotState> {
        self.inner.lock().slots.get(slot_index).copied()
    }

    /// Handles of all committed slots, in generation order.
    pub fn committed(&self) -> Vec<SlotHandle> {
        let inner = self.inner.lock();
        let mut handles: Vec<_> = inner
            .slots
            .iter()
            .filter_map(|s| match s {
                SlotState::Committed { generation, .. } => Some(self.handle(*generation)),
                _ => None,
            })
            .collect();
        handles.sort_by_key(|h| h.generation);
        handles
    }

    /// Number of free slots.
    pub fn free_slots(&self) -> usize {
        self.inner.lock().slots.iter().filter(|s| **s == SlotState::Free).count()
    }
}

impl std::fmt::Debug for SlotAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotAllocator")
            .field("cf_id", &self.cf_id)
            .field("pool_size", &self.pool_size)
            .field("free", &self.free_slots())
            .finish()
    }
}
