//! Table file footer.
//!
//! The footer is a fixed-size (48 bytes) structure at the end of a table file
//! that points at the range-deletion block and the index block.

use crate::error::{Error, Result};
use crate::sstable::{FOOTER_SIZE, MAGIC_NUMBER};

/// BlockHandle represents a pointer to a block in the table file.
///
/// The size includes the block trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    /// Offset of the block in the file
    pub offset: u64,
    /// Size of the block in bytes
    pub size: u64,
}

impl BlockHandle {
    /// Create a new BlockHandle
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// Encode the BlockHandle to bytes (16 bytes: 8 for offset + 8 for size)
    pub fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Decode a BlockHandle from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        let field = |range: std::ops::Range<usize>| -> Result<u64> {
            data.get(range)
                .and_then(|b| b.try_into().ok())
                .map(u64::from_le_bytes)
                .ok_or_else(|| Error::corruption("BlockHandle too short"))
        };
        Ok(Self { offset: field(0..8)?, size: field(8..16)? })
    }

    /// Get the end offset of this block
    pub fn end_offset(&self) -> u64 {
        self.offset + self.size
    }
}

/// Footer is the last 48 bytes of a table file.
///
/// Format:
/// ```text
/// [range_del_handle: 16 bytes]
/// [index_handle: 16 bytes]
/// [padding: 8 bytes]
/// [magic: 8 bytes]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    /// Handle to the range-deletion block
    pub range_del_handle: BlockHandle,
    /// Handle to the index block
    pub index_handle: BlockHandle,
}

impl Footer {
    /// Create a new Footer
    pub fn new(range_del_handle: BlockHandle, index_handle: BlockHandle) -> Self {
        Self { range_del_handle, index_handle }
    }

    /// Encode the footer to bytes
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..16].copy_from_slice(&self.range_del_handle.encode());
        buf[16..32].copy_from_slice(&self.index_handle.encode());
        // 32..40 reserved
        buf[40..48].copy_from_slice(&MAGIC_NUMBER.to_le_bytes());
        buf
    }

    /// Decode a footer from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != FOOTER_SIZE {
            return Err(Error::corruption(format!(
                "Footer size mismatch: expected {}, got {}",
                FOOTER_SIZE,
                data.len()
            )));
        }

        let magic = u64::from_le_bytes(
            data[40..48].try_into().map_err(|_| Error::corruption("Footer too short"))?,
        );
        if magic != MAGIC_NUMBER {
            return Err(Error::corruption(format!(
                "Invalid table magic number: expected {:#x}, got {:#x}",
                MAGIC_NUMBER, magic
            )));
        }

        Ok(Self {
            range_del_handle: BlockHandle::decode(&data[0..16])?,
            index_handle: BlockHandle::decode(&data[16..32])?,
        })
    }
}
