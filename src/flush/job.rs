//! Flush job.
//!
//! Runs one generation of one column family from start to end:
//!
//! 1. Pick the pending memtables and reserve the slot of the next generation.
//! 2. Build, sync and close the table file.
//! 3. Commit the slot, which logs the identity before anything else sees it.
//! 4. Hand the sealed bytes to the ship queue.
//! 5. Run the paranoid re-read while the ship is in flight.
//! 6. Wait for the acknowledgement and mark the slot acknowledged.
//!
//! A failure before step 3 rolls the generation back: the slot is released,
//! the generation is skipped in the ship queue, partial files are deleted and
//! the memtables return to the pending set.

use super::compositor::{CompositorStats, MergingIterator};
use super::{build_table, table_path, verify_table, BuildOutcome, BuildRequest, FlushGeneration};
use crate::column_family::{ColumnFamily, LiveFile, PickedFlush};
use crate::config::Options;
use crate::error::{Error, Result};
use crate::ship::{ShipAck, ShipQueue, ShipRequest, ShipTicket};
use crate::slots::SlotHandle;
use crate::sstable::{BufferMode, FileIdentity};
use std::path::Path;
use std::sync::atomic::AtomicBool;

/// What a flush job works with.
pub struct FlushContext<'a> {
    /// Data directory.
    pub dir: &'a Path,
    /// Node options.
    pub options: &'a Options,
    /// Column family being flushed.
    pub cf: &'a ColumnFamily,
    /// Outbound queue, if this node ships its files.
    pub ship: Option<&'a ShipQueue>,
    /// Live snapshot sequence numbers.
    pub snapshots: Vec<u64>,
    /// Set when the node shuts down.
    pub cancel: &'a AtomicBool,
}

/// Result of a flush job.
#[derive(Debug, Clone)]
pub struct FlushSummary {
    /// Column family flushed.
    pub cf_id: u32,
    /// Generation of the flush.
    pub generation: u64,
    /// File number of the generation's slot.
    pub file_number: u64,
    /// Size of the new file, 0 if no file was produced.
    pub file_size: u64,
    /// Identity of the new file.
    pub identity: Option<FileIdentity>,
    /// Number of memtables consolidated.
    pub input_count: usize,
    /// Acknowledgement of the next node, if the file was shipped.
    pub ack: Option<ShipAck>,
    /// Whether the tail of the chain holds the file.
    pub chain_durable: bool,
    /// Compositor counters.
    pub stats: CompositorStats,
}

/// One flush of one column family.
pub struct FlushJob<'a> {
    ctx: FlushContext<'a>,
}

impl<'a> FlushJob<'a> {
    /// Creates a job.
    pub fn new(ctx: FlushContext<'a>) -> Self {
        Self { ctx }
    }

    /// Runs the flush. Returns `None` if no memtable was waiting.
    pub fn run(self) -> Result<Option<FlushSummary>> {
        let Some(picked) = self.ctx.cf.begin_flush()? else {
            return Ok(None);
        };
        let handle = picked.handle;
        let generation = FlushGeneration {
            cf_id: self.ctx.cf.id(),
            generation: handle.generation,
            input_count: picked.memtables.len(),
            target_file_size: self.ctx.options.target_file_size,
            snapshots: self.ctx.snapshots.clone(),
        };

        log::info!(
            "Starting flush of cf {} generation {} ({} memtables) into file {}",
            self.ctx.cf.name(),
            generation.generation,
            generation.input_count,
            handle.file_number
        );

        let outcome = match self.build(&picked, &generation) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.rollback(&handle, &e);
                return Err(e);
            }
        };

        let Some(identity) = outcome.identity.clone() else {
            return self.finish_empty(&handle, &generation, outcome.stats);
        };

        if let Err(e) = self.ctx.cf.slots().commit(&handle, &identity) {
            self.delete_outputs(identity.file_number, outcome.blob.is_some());
            self.rollback(&handle, &e);
            return Err(e);
        }

        self.complete(handle, generation, identity, outcome)
    }

    fn build(&self, picked: &PickedFlush, generation: &FlushGeneration) -> Result<BuildOutcome> {
        let range_tombstones = picked.memtables.iter().flat_map(|m| m.range_tombstones()).collect();
        let buffer_mode = if self.ctx.ship.is_some() { BufferMode::Retain } else { BufferMode::Stream };

        build_table(BuildRequest {
            dir: self.ctx.dir,
            options: self.ctx.options,
            generation,
            file_number: picked.handle.file_number,
            input: Box::new(MergingIterator::from_memtables(&picked.memtables)),
            range_tombstones,
            buffer_mode,
            cancel: Some(self.ctx.cancel),
        })
    }

    fn finish_empty(
        &self,
        handle: &SlotHandle,
        generation: &FlushGeneration,
        stats: CompositorStats,
    ) -> Result<Option<FlushSummary>> {
        self.ctx.cf.slots().release(handle)?;
        if let Some(ship) = self.ctx.ship {
            ship.skip(handle.cf_id, handle.generation)?;
        }
        self.ctx.cf.finish_flush(handle.generation);

        Ok(Some(FlushSummary {
            cf_id: handle.cf_id,
            generation: handle.generation,
            file_number: handle.file_number,
            file_size: 0,
            identity: None,
            input_count: generation.input_count,
            ack: None,
            chain_durable: false,
            stats,
        }))
    }

    fn complete(
        &self,
        handle: SlotHandle,
        generation: FlushGeneration,
        identity: FileIdentity,
        outcome: BuildOutcome,
    ) -> Result<Option<FlushSummary>> {
        let ticket = self.submit(&handle, &outcome);

        let verified = if self.ctx.options.paranoid_file_checks {
            let path = table_path(self.ctx.dir, self.ctx.options, identity.file_number);
            verify_table(&path, &outcome.digest, self.ctx.options.check_flush_key_order)
        } else {
            Ok(())
        };

        let shipped: Result<Option<ShipAck>> = match ticket {
            Some(Ok(ticket)) => ticket.wait().map(Some),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        };

        let chain_durable = match &shipped {
            Ok(Some(ack)) => ack.chain_durable,
            Ok(None) => self.ctx.options.chain.policy().is_durability_boundary(),
            Err(_) => false,
        };
        let acknowledged = matches!(&shipped, Ok(Some(_))) || chain_durable;
        let file = LiveFile {
            identity: identity.clone(),
            generation: handle.generation,
            digest: Some(outcome.digest),
            blob: outcome.blob.clone(),
            chain_durable,
        };

        if let Err(e) = verified {
            log::error!(
                "Paranoid check of file {} failed, keeping it flagged: {}",
                identity.file_number,
                e
            );
            self.ctx.cf.flag_file(file);
            self.ctx.cf.finish_flush(handle.generation);
            match &shipped {
                Err(ship_err) => {
                    log::error!("File {} was also not shipped: {}", identity.file_number, ship_err)
                }
                Ok(_) if acknowledged => {
                    if let Err(ack_err) = self.ctx.cf.slots().acknowledge(&handle) {
                        log::error!(
                            "Failed to record acknowledgement of file {}: {}",
                            identity.file_number,
                            ack_err
                        );
                    }
                }
                Ok(_) => {}
            }
            return Err(e);
        }

        self.ctx.cf.install_file(file);
        self.ctx.cf.finish_flush(handle.generation);

        let ack = shipped?;
        if acknowledged {
            self.ctx.cf.slots().acknowledge(&handle)?;
        }

        log::info!(
            "Flush of cf {} generation {} completed: file {} ({} bytes, {} entries)",
            self.ctx.cf.name(),
            generation.generation,
            identity.file_number,
            identity.file_size,
            identity.num_entries
        );

        Ok(Some(FlushSummary {
            cf_id: handle.cf_id,
            generation: handle.generation,
            file_number: identity.file_number,
            file_size: identity.file_size,
            input_count: generation.input_count,
            identity: Some(identity),
            ack,
            chain_durable,
            stats: outcome.stats,
        }))
    }

    fn submit(&self, handle: &SlotHandle, outcome: &BuildOutcome) -> Option<Result<ShipTicket>> {
        let ship = self.ctx.ship?;
        let Some(payload) = outcome.payload.as_ref() else {
            return Some(Err(Error::internal(format!(
                "file {} was built without a ship buffer",
                handle.file_number
            ))));
        };
        let request =
            ShipRequest::new(handle.cf_id, handle.generation, handle.file_number, payload.share());
        Some(ship.submit(request))
    }

    fn rollback(&self, handle: &SlotHandle, cause: &Error) {
        log::warn!(
            "Flush of cf {} generation {} failed, rolling back: {}",
            self.ctx.cf.name(),
            handle.generation,
            cause
        );
        if let Err(e) = self.ctx.cf.slots().release(handle) {
            log::error!("Failed to release slot {}: {}", handle.slot_index, e);
        }
        if let Some(ship) = self.ctx.ship {
            if let Err(e) = ship.skip(handle.cf_id, handle.generation) {
                log::warn!("Failed to skip generation {} in ship order: {}", handle.generation, e);
            }
        }
        self.ctx.cf.abort_flush(handle.generation);
    }

    fn delete_outputs(&self, file_number: u64, has_blob: bool) {
        let path = table_path(self.ctx.dir, self.ctx.options, file_number);
        if let Err(e) = crate::sstable::writer::remove_if_exists(&path) {
            log::warn!("Failed to delete {}: {}", path.display(), e);
        }
        if has_blob {
            let blob = self.ctx.dir.join(super::blob::blob_file_name(file_number));
            if let Err(e) = crate::sstable::writer::remove_if_exists(&blob) {
                log::warn!("Failed to delete {}: {}", blob.display(), e);
            }
        }
    }
}
