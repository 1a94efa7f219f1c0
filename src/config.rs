//! Configuration options for a ChainDb node.

use crate::chain::{ChainConfig, Role};
use crate::ship::retry::RetryPolicy;
use crate::sstable::TableFormat;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Extra room reserved in a ship buffer on top of the expected table bytes.
pub const DEFAULT_SST_PAD_LEN: usize = 1 << 20;

/// Alignment of buffers handed to the file system.
pub const DEFAULT_IO_ALIGNMENT: usize = 4096;

/// Configuration options for opening a node.
///
/// Options can be kept in a JSON file; fields missing from the file take
/// their default value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Create the data directory if it doesn't exist.
    /// Default: true
    pub create_if_missing: bool,

    /// Error if the data directory already holds a node.
    /// Default: false
    pub error_if_exists: bool,

    /// Size threshold at which the active memtable is frozen (in bytes).
    /// Default: 4MB
    pub memtable_size: usize,

    /// Maximum number of memtables (active plus frozen) per column family.
    /// Default: 2
    pub max_write_buffer_number: usize,

    /// Expected size of one flushed table file (in bytes).
    /// Default: 4MB
    pub target_file_size: usize,

    /// Block size for table files (in bytes).
    /// Default: 4KB
    pub block_size: usize,

    /// Compression algorithm for data blocks.
    /// Default: CompressionType::Snappy
    pub compression: CompressionType,

    /// Table file format.
    /// Default: TableFormat::BlockBased
    pub table_format: TableFormat,

    /// Re-read every flushed file and compare it with what was written.
    /// Default: false
    pub paranoid_file_checks: bool,

    /// Reject flush input whose keys are not strictly increasing.
    /// Default: true
    pub check_flush_key_order: bool,

    /// Store large values in a blob file next to the table file.
    /// Not compatible with shipping.
    /// Default: false
    pub enable_blob_files: bool,

    /// Values at least this large go to the blob file.
    /// Default: 4KB
    pub min_blob_size: usize,

    /// Mark a flushed file for compaction once this share of its entries
    /// are deletions. `None` disables marking.
    /// Default: None
    pub mark_for_compaction_deletion_ratio: Option<f64>,

    /// Padding added to the ship buffer size estimate (in bytes).
    /// Default: 1MB
    pub sst_pad_len: usize,

    /// Alignment of ship buffers and of the final file write.
    /// Default: 4096
    pub io_alignment: usize,

    /// Use `fsync` (sync_all) instead of `fdatasync` (sync_data) for table files.
    /// Default: true
    pub use_fsync: bool,

    /// Number of background flush threads.
    /// Default: 1
    pub background_threads: usize,

    /// Column families besides the default one, created at open.
    /// Default: empty
    pub column_families: Vec<String>,

    /// Slot pool configuration.
    pub slot_pool: SlotPoolOptions,

    /// Position of this node in the replication chain.
    pub chain: ChainConfig,

    /// Retry policy for outbound shipments.
    pub retry: RetryPolicy,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            memtable_size: 4 * 1024 * 1024,    // 4MB
            max_write_buffer_number: 2,
            target_file_size: 4 * 1024 * 1024, // 4MB
            block_size: 4 * 1024,              // 4KB
            compression: CompressionType::default(),
            table_format: TableFormat::BlockBased,
            paranoid_file_checks: false,
            check_flush_key_order: true,
            enable_blob_files: false,
            min_blob_size: 4 * 1024,
            mark_for_compaction_deletion_ratio: None,
            sst_pad_len: DEFAULT_SST_PAD_LEN,
            io_alignment: DEFAULT_IO_ALIGNMENT,
            use_fsync: true,
            background_threads: 1,
            column_families: Vec::new(),
            slot_pool: SlotPoolOptions::default(),
            chain: ChainConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// What `reserve` does when the slot a generation maps to is still in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Return `PoolExhausted` immediately.
    FailFast,
    /// Wait for the slot to be released, up to the timeout.
    Block {
        /// Longest time to wait before giving up.
        timeout: Duration,
    },
}

/// Sizing and backpressure options of the slot pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotPoolOptions {
    /// Fixed number of slots per column family. Derived from
    /// `capacity_bytes` when `None`.
    /// Default: None
    pub pool_size: Option<usize>,

    /// Expected amount of live table data per column family (in bytes).
    /// Default: 1GB
    pub capacity_bytes: u64,

    /// Behavior when the pool is exhausted.
    /// Default: FailFast
    pub exhaustion: ExhaustionPolicy,
}

impl Default for SlotPoolOptions {
    fn default() -> Self {
        Self {
            pool_size: None,
            capacity_bytes: 1024 * 1024 * 1024, // 1GB
            exhaustion: ExhaustionPolicy::FailFast,
        }
    }
}

/// Compression algorithms supported by ChainDb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CompressionType {
    /// No compression.
    None = 0,

    /// Snappy compression (fast, moderate compression ratio).
    #[cfg(feature = "snappy")]
    Snappy = 1,
}

impl CompressionType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionType::None),
            #[cfg(feature = "snappy")]
            1 => Some(CompressionType::Snappy),
            _ => None,
        }
    }
}

impl Default for CompressionType {
    fn default() -> Self {
        #[cfg(feature = "snappy")]
        return CompressionType::Snappy;

        #[cfg(not(feature = "snappy"))]
        CompressionType::None
    }
}

impl Options {
    /// Creates a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the data directory if it doesn't exist.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the memtable size threshold.
    pub fn memtable_size(mut self, size: usize) -> Self {
        self.memtable_size = size;
        self
    }

    /// Sets the maximum number of memtables per column family.
    pub fn max_write_buffer_number(mut self, count: usize) -> Self {
        self.max_write_buffer_number = count;
        self
    }

    /// Sets the expected table file size.
    pub fn target_file_size(mut self, size: usize) -> Self {
        self.target_file_size = size;
        self
    }

    /// Sets the block size for table files.
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Sets the compression algorithm.
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Enables or disables the post-flush re-read check.
    pub fn paranoid_file_checks(mut self, value: bool) -> Self {
        self.paranoid_file_checks = value;
        self
    }

    /// Enables or disables key order checking during flush.
    pub fn check_flush_key_order(mut self, value: bool) -> Self {
        self.check_flush_key_order = value;
        self
    }

    /// Enables blob files for values of at least `min_blob_size` bytes.
    pub fn blob_files(mut self, min_blob_size: usize) -> Self {
        self.enable_blob_files = true;
        self.min_blob_size = min_blob_size;
        self
    }

    /// Sets the deletion ratio above which flushed files are marked for compaction.
    pub fn mark_for_compaction_deletion_ratio(mut self, ratio: f64) -> Self {
        self.mark_for_compaction_deletion_ratio = Some(ratio);
        self
    }

    /// Sets the number of background flush threads.
    pub fn background_threads(mut self, count: usize) -> Self {
        self.background_threads = count;
        self
    }

    /// Adds a column family created at open.
    pub fn column_family(mut self, name: impl Into<String>) -> Self {
        self.column_families.push(name.into());
        self
    }

    /// Sets an explicit slot pool size.
    pub fn slot_pool_size(mut self, size: usize) -> Self {
        self.slot_pool.pool_size = Some(size);
        self
    }

    /// Sets the slot pool exhaustion policy.
    pub fn slot_exhaustion(mut self, policy: ExhaustionPolicy) -> Self {
        self.slot_pool.exhaustion = policy;
        self
    }

    /// Sets the chain position of this node.
    pub fn chain(mut self, chain: ChainConfig) -> Self {
        self.chain = chain;
        self
    }

    /// Sets the shipment retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Number of slots per column family.
    ///
    /// Without an explicit size the pool holds enough slots for
    /// `capacity_bytes` of table files plus every memtable of every replica
    /// in flight at once.
    pub fn effective_pool_size(&self) -> usize {
        if let Some(size) = self.slot_pool.pool_size {
            return size;
        }
        let target = self.target_file_size.max(1) as u64;
        let data_slots = self.slot_pool.capacity_bytes.div_ceil(target) as usize;
        data_slots + self.max_write_buffer_number * self.chain.replication_factor
    }

    /// Size of the buffer a flush of `input_count` memtables writes into.
    ///
    /// Shipping roles retain the whole table in memory so that the same bytes
    /// can be written locally and shipped. Other roles stream to disk through
    /// a small buffer.
    pub fn ship_buffer_size(&self, input_count: usize) -> usize {
        if !self.chain.policy().ships_onward() {
            return crate::ship::buffer::MIN_STREAM_BUFFER;
        }
        let raw = input_count.max(1) * self.target_file_size + self.sst_pad_len;
        raw.div_ceil(self.io_alignment) * self.io_alignment
    }

    /// Reads options from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let options: Options = serde_json::from_slice(&data)?;
        log::debug!("Loaded options from {:?}", path.as_ref());
        Ok(options)
    }

    /// Writes the options to a JSON file.
    pub fn save_json_file<P: AsRef<Path>>(&self, path: P) -> crate::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        if self.memtable_size == 0 {
            return Err(crate::Error::invalid_argument("memtable_size must be > 0"));
        }
        if self.max_write_buffer_number == 0 {
            return Err(crate::Error::invalid_argument("max_write_buffer_number must be > 0"));
        }
        if self.target_file_size == 0 {
            return Err(crate::Error::invalid_argument("target_file_size must be > 0"));
        }
        if self.block_size == 0 {
            return Err(crate::Error::invalid_argument("block_size must be > 0"));
        }
        if self.background_threads == 0 {
            return Err(crate::Error::invalid_argument("background_threads must be > 0"));
        }
        if self.io_alignment == 0 || !self.io_alignment.is_power_of_two() {
            return Err(crate::Error::invalid_argument("io_alignment must be a power of two"));
        }
        if self.effective_pool_size() == 0 {
            return Err(crate::Error::invalid_argument("slot pool size must be > 0"));
        }
        if let Some(ratio) = self.mark_for_compaction_deletion_ratio {
            if ratio <= 0.0 || ratio > 1.0 {
                return Err(crate::Error::invalid_argument(
                    "mark_for_compaction_deletion_ratio must be in (0, 1]",
                ));
            }
        }
        self.chain.validate()?;
        if self.enable_blob_files && self.chain.role != Role::Tail && self.chain.downstream.is_some()
        {
            return Err(crate::Error::invalid_argument(
                "blob files are not shipped; disable them on shipping nodes",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(crate::Error::invalid_argument("retry.max_attempts must be > 0"));
        }
        Ok(())
    }
}
