//! Table file format.
//!
//! A table is an immutable, sorted file produced by one flush.
//!
//! ## File Format
//!
//! ```text
//! [Data Block 1]
//! [Data Block 2]
//! ...
//! [Data Block N]
//! [Range-Deletion Block] // start@seq#RangeDeletion -> end
//! [Index Block]          // last key of each data block -> handle
//! [Footer: 48B]          // points to the two blocks above
//! ```
//!
//! Keys are encoded internal keys. Every block carries a trailer with its
//! compression type and a crc32 of the stored bytes.

pub mod block;
pub mod builder;
pub mod footer;
pub mod index;
pub mod reader;
pub mod writer;

pub use builder::{FileIdentity, FinishedTable, SSTableBuilder};
pub use reader::SSTableReader;
pub use writer::{BufferMode, TableFileWriter};

pub use crate::config::CompressionType;

use crate::config::Options;
use serde::{Deserialize, Serialize};

/// Default block size (4KB)
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Footer size in bytes (fixed)
pub const FOOTER_SIZE: usize = 48;

/// Magic number for table files ("CHAINSST")
pub const MAGIC_NUMBER: u64 = 0x5453_534e_4941_4843;

/// Name of the whole-file checksum recorded in [`FileIdentity`].
pub const CHECKSUM_FUNC_NAME: &str = "crc32";

/// Table formats a node can write, chosen once in [`Options`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableFormat {
    /// Prefix-compressed data blocks with an index block.
    #[default]
    BlockBased,
}

impl TableFormat {
    /// Creates a builder for table `file_number` writing through `writer`.
    pub fn new_builder(
        &self,
        file_number: u64,
        writer: TableFileWriter,
        options: &Options,
    ) -> SSTableBuilder {
        match self {
            TableFormat::BlockBased => {
                SSTableBuilder::new(file_number, writer, options.block_size, options.compression)
            }
        }
    }

    /// File name of table `file_number`.
    pub fn file_name(&self, file_number: u64) -> String {
        match self {
            TableFormat::BlockBased => format!("{:06}.sst", file_number),
        }
    }
}
