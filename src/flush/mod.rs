//! Flush pipeline.
//!
//! A flush turns the frozen memtables of one generation into a single table
//! file:
//!
//! 1. [`compositor::MergingIterator`] merges the memtables in internal-key order.
//! 2. [`compositor::Compositor`] drops superseded and range-deleted entries and
//!    moves large values into a blob file.
//! 3. Every surviving entry passes through the [`validator::OutputValidator`]
//!    and into the table builder, whose writer stages the bytes in the ship
//!    buffer.
//! 4. The file is synced, and in `Retain` mode the buffer is sealed so the
//!    very same bytes can be shipped.
//!
//! [`build_table`] does steps 1-4. [`job::FlushJob`] wraps it with slot
//! reservation, shipping and bookkeeping.

pub mod blob;
pub mod compositor;
pub mod job;
pub mod range_del;
pub mod scheduler;
pub mod validator;

pub use job::{FlushJob, FlushSummary};
pub use validator::{OutputValidator, ValidatorDigest};

use crate::config::Options;
use crate::error::{Error, Result};
use crate::ship::buffer::SealedBuffer;
use crate::sstable::{BufferMode, FileIdentity, SSTableBuilder, SSTableReader, TableFileWriter};
use blob::{BlobFileAddition, BlobFileBuilder};
use compositor::{Compositor, CompositorStats, EntrySource};
use range_del::RangeTombstone;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// One flush attempt of a column family.
///
/// `input_count` (write buffers consolidated) and `target_file_size` (bytes of
/// output) are separate quantities: the first sizes the ship buffer, the
/// second is the per-buffer byte budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushGeneration {
    /// Column family being flushed.
    pub cf_id: u32,
    /// Generation index, strictly increasing per column family.
    pub generation: u64,
    /// Number of memtables consolidated by this flush.
    pub input_count: usize,
    /// Expected output size per memtable.
    pub target_file_size: usize,
    /// Live snapshot sequence numbers.
    pub snapshots: Vec<u64>,
}

/// Everything [`build_table`] needs.
pub struct BuildRequest<'a> {
    /// Directory holding table and blob files.
    pub dir: &'a Path,
    /// Node options.
    pub options: &'a Options,
    /// The generation being flushed.
    pub generation: &'a FlushGeneration,
    /// File number assigned by the slot allocator.
    pub file_number: u64,
    /// Record stream in ascending internal-key order.
    pub input: EntrySource<'a>,
    /// Range tombstones of the consolidated memtables.
    pub range_tombstones: Vec<RangeTombstone>,
    /// Whether the output bytes are retained for shipping.
    pub buffer_mode: BufferMode,
    /// Set when the node shuts down.
    pub cancel: Option<&'a AtomicBool>,
}

/// Result of [`build_table`].
#[derive(Debug)]
pub struct BuildOutcome {
    /// Identity of the new file, `None` if the flush produced no output.
    pub identity: Option<FileIdentity>,
    /// Size of the new file, 0 if no file was written.
    pub file_size: u64,
    /// The synced bytes, present in `Retain` mode.
    pub payload: Option<SealedBuffer>,
    /// Blob file written next to the table.
    pub blob: Option<BlobFileAddition>,
    /// Digest of the entries written, for paranoid verification.
    pub digest: ValidatorDigest,
    /// Compositor counters.
    pub stats: CompositorStats,
}

impl BuildOutcome {
    /// Returns true if no file was produced.
    pub fn is_empty(&self) -> bool {
        self.identity.is_none()
    }
}

/// Path of table `file_number` in `dir`.
pub fn table_path(dir: &Path, options: &Options, file_number: u64) -> PathBuf {
    dir.join(options.table_format.file_name(file_number))
}

/// Builds, syncs and closes the table file of one flush.
///
/// On error the partial table and blob files are deleted. A flush whose
/// output is empty leaves no file behind and reports a size of 0.
pub fn build_table(req: BuildRequest<'_>) -> Result<BuildOutcome> {
    let BuildRequest {
        dir,
        options,
        generation,
        file_number,
        input,
        range_tombstones,
        buffer_mode,
        cancel,
    } = req;

    let path = table_path(dir, options, file_number);
    let writer = TableFileWriter::create(
        &path,
        buffer_mode,
        options.ship_buffer_size(generation.input_count),
        options.io_alignment,
        options.use_fsync,
    )?;
    let mut builder = options.table_format.new_builder(file_number, writer, options);
    let mut blob = options
        .enable_blob_files
        .then(|| BlobFileBuilder::new(dir, file_number, options.min_blob_size));
    let mut validator = OutputValidator::new(options.check_flush_key_order);

    log::debug!(
        "Building table {} for cf {} generation {} from {} memtables",
        path.display(),
        generation.cf_id,
        generation.generation,
        generation.input_count
    );

    let written = write_entries(
        &mut builder,
        &mut validator,
        input,
        range_tombstones,
        generation.snapshots.clone(),
        blob.as_mut(),
        cancel,
    );
    let stats = match written {
        Ok(stats) => stats,
        Err(e) => {
            discard(builder, blob);
            return Err(e);
        }
    };

    if builder.is_empty() {
        log::info!(
            "Flush of cf {} generation {} produced no entries, skipping table creation",
            generation.cf_id,
            generation.generation
        );
        discard(builder, blob);
        return Ok(BuildOutcome {
            identity: None,
            file_size: 0,
            payload: None,
            blob: None,
            digest: validator.digest(),
            stats,
        });
    }

    let finished = match builder.finish() {
        Ok(finished) => finished,
        Err(e) => {
            discard_blob(blob);
            remove_partial(&path);
            return Err(e);
        }
    };
    let mut identity = finished.identity;
    let mut writer = finished.writer;
    if let Some(ratio) = options.mark_for_compaction_deletion_ratio {
        identity.marked_for_compaction = identity.deletion_ratio() >= ratio;
    }

    if let Err(e) = writer.sync() {
        discard_blob(blob);
        if let Err(abandon_err) = writer.abandon() {
            log::warn!("Failed to delete unsynced table {}: {}", path.display(), abandon_err);
        }
        return Err(e);
    }
    let payload = writer.close();

    let blob = match blob.map(BlobFileBuilder::finish).transpose() {
        Ok(addition) => addition.flatten(),
        Err(e) => {
            remove_partial(&path);
            return Err(e);
        }
    };

    log_table_creation(generation, &identity, &stats, blob.as_ref());

    Ok(BuildOutcome {
        file_size: identity.file_size,
        identity: Some(identity),
        payload,
        blob,
        digest: validator.digest(),
        stats,
    })
}

fn write_entries(
    builder: &mut SSTableBuilder,
    validator: &mut OutputValidator,
    input: EntrySource<'_>,
    range_tombstones: Vec<RangeTombstone>,
    snapshots: Vec<u64>,
    blob: Option<&mut BlobFileBuilder>,
    cancel: Option<&AtomicBool>,
) -> Result<CompositorStats> {
    let mut compositor = Compositor::new(input, range_tombstones, snapshots, blob);
    for entry in compositor.by_ref() {
        if cancel.is_some_and(|flag| flag.load(Ordering::Acquire)) {
            return Err(Error::Cancelled(format!("flush of table {} aborted", builder.file_number())));
        }
        let (key, value) = entry?;
        let encoded = key.encode();
        validator.add(&encoded, &value)?;
        builder.add(&encoded, &value)?;
    }

    let (tombstones, stats) = compositor.finish();
    for tombstone in &tombstones {
        builder.add_range_tombstone(tombstone);
    }
    Ok(stats)
}

fn discard(builder: SSTableBuilder, blob: Option<BlobFileBuilder>) {
    let file_number = builder.file_number();
    if let Err(e) = builder.abandon() {
        log::warn!("Failed to delete partial table {}: {}", file_number, e);
    }
    discard_blob(blob);
}

fn remove_partial(path: &Path) {
    if let Err(e) = crate::sstable::writer::remove_if_exists(path) {
        log::warn!("Failed to delete partial table {}: {}", path.display(), e);
    }
}

fn discard_blob(blob: Option<BlobFileBuilder>) {
    if let Some(blob) = blob {
        if let Err(e) = blob.abandon() {
            log::warn!("Failed to delete partial blob file: {}", e);
        }
    }
}

fn log_table_creation(
    generation: &FlushGeneration,
    identity: &FileIdentity,
    stats: &CompositorStats,
    blob: Option<&BlobFileAddition>,
) {
    let event = serde_json::json!({
        "event": "table_file_creation",
        "cf_id": generation.cf_id,
        "generation": generation.generation,
        "file_number": identity.file_number,
        "file_size": identity.file_size,
        "smallest_seqno": identity.smallest_seqno,
        "largest_seqno": identity.largest_seqno,
        "num_entries": identity.num_entries,
        "num_deletions": identity.num_deletions,
        "num_range_deletions": identity.num_range_deletions,
        "file_checksum": format!("{:#010x}", identity.file_checksum),
        "file_checksum_func_name": identity.checksum_func_name,
        "marked_for_compaction": identity.marked_for_compaction,
        "input_entries": stats.input_entries,
        "superseded": stats.superseded,
        "range_deleted": stats.range_deleted,
        "blob_file_number": blob.map(|b| b.file_number),
        "blob_count": blob.map(|b| b.blob_count),
    });
    log::info!("{}", event);
}

/// Re-reads a sealed table and compares its entries with `expected`.
///
/// Every failure to read the file back, checksum errors included, is
/// reported as `Corruption`.
pub fn verify_table(path: &Path, expected: &ValidatorDigest, check_order: bool) -> Result<()> {
    let reread = || -> Result<ValidatorDigest> {
        let reader = SSTableReader::open(path)?;
        let mut validator = OutputValidator::new(check_order);
        let mut iter = reader.iter()?;
        iter.seek_to_first()?;
        while iter.advance()? {
            validator.add(iter.key(), iter.value())?;
        }
        Ok(validator.digest())
    };

    let actual = reread().map_err(|e| match e {
        Error::Corruption(msg) => Error::Corruption(msg),
        other => Error::Corruption(format!("re-read of {} failed: {}", path.display(), other)),
    })?;

    if actual != *expected {
        return Err(Error::Corruption(format!(
            "paranoid check of {} failed: wrote {} entries (hash {:#x}), read back {} entries (hash {:#x})",
            path.display(),
            expected.entries,
            expected.hash,
            actual.entries,
            actual.hash
        )));
    }
    Ok(())
}
