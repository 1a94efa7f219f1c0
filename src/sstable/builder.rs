//! Table builder.
//!
//! Builds a table file from a sequence of internal-key entries and range
//! tombstones. Bytes go through a [`TableFileWriter`], so the builder never
//! touches the file system directly.

use crate::error::{Error, Result};
use crate::flush::range_del::RangeTombstone;
use crate::memtable::{compare_internal_keys, InternalKey, ValueType};
use crate::sstable::block::{BlockBuilder, BLOCK_TRAILER_SIZE};
use crate::sstable::footer::{BlockHandle, Footer};
use crate::sstable::index::{IndexBlockBuilder, IndexEntry};
use crate::sstable::writer::TableFileWriter;
use crate::sstable::{CompressionType, CHECKSUM_FUNC_NAME};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

const DATA_BLOCK_RESTART_INTERVAL: usize = 16;

/// Identity and metadata of a finished table file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIdentity {
    /// File number, chain-wide identical for one generation.
    pub file_number: u64,
    /// Size of the file in bytes.
    pub file_size: u64,
    /// Smallest encoded internal key, range tombstones included.
    pub smallest_key: Vec<u8>,
    /// Largest encoded internal key, range tombstones included.
    pub largest_key: Vec<u8>,
    /// Smallest sequence number in the file.
    pub smallest_seqno: u64,
    /// Largest sequence number in the file.
    pub largest_seqno: u64,
    /// Number of point entries.
    pub num_entries: u64,
    /// Number of point deletions among the entries.
    pub num_deletions: u64,
    /// Number of range tombstones.
    pub num_range_deletions: u64,
    /// Checksum of the whole file.
    pub file_checksum: u32,
    /// Name of the function that computed `file_checksum`.
    pub checksum_func_name: String,
    /// Whether the file should be picked for compaction early.
    pub marked_for_compaction: bool,
}

impl FileIdentity {
    /// Share of entries (point and range) that delete data.
    pub fn deletion_ratio(&self) -> f64 {
        let total = self.num_entries + self.num_range_deletions;
        if total == 0 {
            return 0.0;
        }
        (self.num_deletions + self.num_range_deletions) as f64 / total as f64
    }
}

/// Output of [`SSTableBuilder::finish`]: the identity plus the writer that
/// still holds the unsynced bytes.
#[derive(Debug)]
pub struct FinishedTable {
    /// Identity of the table.
    pub identity: FileIdentity,
    /// Writer for the table file, ready to be synced and closed.
    pub writer: TableFileWriter,
}

/// Running min/max of encoded internal keys and sequence numbers.
#[derive(Debug, Default)]
struct Boundaries {
    smallest: Option<Vec<u8>>,
    largest: Option<Vec<u8>>,
    smallest_seqno: u64,
    largest_seqno: u64,
    seen: bool,
}

impl Boundaries {
    fn extend(&mut self, smallest: &[u8], largest: &[u8], sequence: u64) {
        match &self.smallest {
            Some(cur) if compare_internal_keys(smallest, cur) != Ordering::Less => {}
            _ => self.smallest = Some(smallest.to_vec()),
        }
        match &self.largest {
            Some(cur) if compare_internal_keys(largest, cur) != Ordering::Greater => {}
            _ => self.largest = Some(largest.to_vec()),
        }
        if self.seen {
            self.smallest_seqno = self.smallest_seqno.min(sequence);
            self.largest_seqno = self.largest_seqno.max(sequence);
        } else {
            self.smallest_seqno = sequence;
            self.largest_seqno = sequence;
            self.seen = true;
        }
    }
}

/// SSTableBuilder builds a block-based table file.
///
/// ```text
/// [Data Block 1] ... [Data Block N]
/// [Range-Deletion Block]
/// [Index Block]
/// [Footer: 48B]
/// ```
///
/// Every block is followed by a 5 byte trailer (compression type and crc32).
pub struct SSTableBuilder {
    file_number: u64,
    writer: TableFileWriter,
    data_block_builder: BlockBuilder,
    index_block_builder: IndexBlockBuilder,
    range_del_block_builder: BlockBuilder,
    last_key: Vec<u8>,
    pending_handle: Option<BlockHandle>,
    num_entries: u64,
    num_deletions: u64,
    num_range_deletions: u64,
    boundaries: Boundaries,
    block_size: usize,
    compression: CompressionType,
}

impl SSTableBuilder {
    /// Creates a builder writing table `file_number` through `writer`.
    pub fn new(
        file_number: u64,
        writer: TableFileWriter,
        block_size: usize,
        compression: CompressionType,
    ) -> Self {
        Self {
            file_number,
            writer,
            data_block_builder: BlockBuilder::new(DATA_BLOCK_RESTART_INTERVAL),
            index_block_builder: IndexBlockBuilder::new(),
            range_del_block_builder: BlockBuilder::new(1),
            last_key: Vec::new(),
            pending_handle: None,
            num_entries: 0,
            num_deletions: 0,
            num_range_deletions: 0,
            boundaries: Boundaries::default(),
            block_size,
            compression,
        }
    }

    /// Adds one entry. `key` is an encoded internal key; keys are expected in
    /// internal-key order.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let ikey = InternalKey::decode(key)
            .ok_or_else(|| Error::corruption("Table entry without a valid internal key"))?;
        if ikey.user_key().is_empty() {
            return Err(Error::invalid_argument("Key cannot be empty"));
        }

        if let Some(handle) = self.pending_handle.take() {
            let entry = IndexEntry::new(self.last_key.clone(), handle);
            self.index_block_builder.add_entry(&entry);
        }

        self.data_block_builder.add(key, value);
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        if ikey.value_type() == ValueType::Deletion {
            self.num_deletions += 1;
        }
        self.boundaries.extend(key, key, ikey.sequence());

        if self.data_block_builder.current_size() >= self.block_size {
            self.flush_data_block()?;
        }
        Ok(())
    }

    /// Adds a range tombstone to the range-deletion block.
    pub fn add_range_tombstone(&mut self, tombstone: &RangeTombstone) {
        let (key, value) = tombstone.encode();
        self.range_del_block_builder.add(&key, &value);
        self.num_range_deletions += 1;
        self.boundaries.extend(&key, &tombstone.largest_key().encode(), tombstone.sequence);
    }

    /// Returns true if neither entries nor tombstones were added.
    pub fn is_empty(&self) -> bool {
        self.num_entries == 0 && self.num_range_deletions == 0
    }

    /// File number of the table being built.
    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    /// Get the number of entries added
    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written so far plus the open data block.
    pub fn current_size(&self) -> u64 {
        self.writer.offset() + self.data_block_builder.current_size() as u64
    }

    fn flush_data_block(&mut self) -> Result<()> {
        if self.data_block_builder.is_empty() {
            return Ok(());
        }
        let builder = std::mem::replace(
            &mut self.data_block_builder,
            BlockBuilder::new(DATA_BLOCK_RESTART_INTERVAL),
        );
        let handle = self.write_block(&builder.finish(), self.compression)?;
        self.pending_handle = Some(handle);
        Ok(())
    }

    /// Writes one block plus its trailer and returns its handle.
    fn write_block(&mut self, raw: &[u8], compression: CompressionType) -> Result<BlockHandle> {
        let stored = compress(raw, compression)?;
        let offset = self.writer.offset();

        self.writer.append(&stored)?;
        let mut trailer = [0u8; BLOCK_TRAILER_SIZE];
        trailer[0] = compression as u8;
        trailer[1..].copy_from_slice(&crc32fast::hash(&stored).to_le_bytes());
        self.writer.append(&trailer)?;

        Ok(BlockHandle::new(offset, (stored.len() + BLOCK_TRAILER_SIZE) as u64))
    }

    /// Seals the table: last data block, range-deletion block, index block and
    /// footer. Tables without entries and tombstones cannot be finished.
    pub fn finish(mut self) -> Result<FinishedTable> {
        if self.is_empty() {
            return Err(Error::invalid_state(format!(
                "table {} has no entries and must be abandoned",
                self.file_number
            )));
        }

        self.flush_data_block()?;
        if let Some(handle) = self.pending_handle.take() {
            let entry = IndexEntry::new(self.last_key.clone(), handle);
            self.index_block_builder.add_entry(&entry);
        }

        let range_del = std::mem::replace(&mut self.range_del_block_builder, BlockBuilder::new(1));
        let range_del_handle = self.write_block(&range_del.finish(), CompressionType::None)?;

        let index = std::mem::take(&mut self.index_block_builder);
        let index_handle = self.write_block(&index.finish(), CompressionType::None)?;

        let footer = Footer::new(range_del_handle, index_handle);
        self.writer.append(&footer.encode())?;

        let Boundaries { smallest, largest, smallest_seqno, largest_seqno, .. } = self.boundaries;
        let identity = FileIdentity {
            file_number: self.file_number,
            file_size: self.writer.offset(),
            smallest_key: smallest.unwrap_or_default(),
            largest_key: largest.unwrap_or_default(),
            smallest_seqno,
            largest_seqno,
            num_entries: self.num_entries,
            num_deletions: self.num_deletions,
            num_range_deletions: self.num_range_deletions,
            file_checksum: self.writer.file_checksum(),
            checksum_func_name: CHECKSUM_FUNC_NAME.to_string(),
            marked_for_compaction: false,
        };

        Ok(FinishedTable { identity, writer: self.writer })
    }

    /// Discards the table and deletes the partial file.
    pub fn abandon(self) -> Result<()> {
        self.writer.abandon()
    }
}

fn compress(raw: &[u8], compression: CompressionType) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(raw.to_vec()),
        #[cfg(feature = "snappy")]
        CompressionType::Snappy => snap::raw::Encoder::new()
            .compress_vec(raw)
            .map_err(|e| Error::internal(format!("Compression failed: {}", e))),
    }
}
