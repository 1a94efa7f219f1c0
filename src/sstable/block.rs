//! Block format implementation for table files.
//!
//! A block contains multiple key-value entries and uses restart points
//! for prefix compression.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the trailer following every block on disk: compression type (1 byte)
/// and crc32 of the stored block bytes (4 bytes).
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Block stores key-value pairs with prefix compression.
///
/// Format:
/// ```text
/// [Entry 1]
/// ...
/// [Entry N]
/// [Restart Point 1: u32]
/// ...
/// [Restart Point M: u32]
/// [Num Restarts: u32]
/// ```
///
/// Each entry format:
/// ```text
/// [shared_key_len: u32]     // Length of shared prefix with previous key
/// [unshared_key_len: u32]   // Length of unshared key suffix
/// [value_len: u32]          // Length of value
/// [unshared_key: bytes]     // Key suffix
/// [value: bytes]            // Value data
/// ```
///
/// Blocks do not order their keys; the caller adds entries in the order they
/// should be read back.
#[derive(Debug, Clone)]
pub struct Block {
    data: Bytes,
    restart_offset: usize,
    num_restarts: u32,
}

impl Block {
    /// Create a new Block from raw data
    pub fn new(data: Bytes) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::corruption("Block too small"));
        }

        let num_restarts = read_u32(&data, data.len() - 4)?;
        let restart_bytes = (num_restarts as usize)
            .checked_mul(4)
            .and_then(|n| n.checked_add(4))
            .ok_or_else(|| Error::corruption("Invalid restart count"))?;
        let restart_offset = data
            .len()
            .checked_sub(restart_bytes)
            .ok_or_else(|| Error::corruption("Invalid restart offset"))?;

        Ok(Self { data, restart_offset, num_restarts })
    }

    /// Get the number of restart points
    pub fn num_restarts(&self) -> u32 {
        self.num_restarts
    }

    fn restart_point(&self, index: u32) -> usize {
        let offset = self.restart_offset + (index as usize * 4);
        read_u32(&self.data, offset).map(|p| p as usize).unwrap_or(self.restart_offset)
    }

    /// Create an iterator over the block
    pub fn iter(&self) -> BlockIterator {
        BlockIterator::new(self.clone())
    }

    /// Get the raw data
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or_else(|| Error::corruption("Truncated block"))
}

/// BlockBuilder builds a block with prefix compression.
pub struct BlockBuilder {
    buffer: BytesMut,
    restarts: Vec<u32>,
    counter: usize,
    last_key: Vec<u8>,
    block_restart_interval: usize,
    num_entries: usize,
}

impl BlockBuilder {
    /// Create a new BlockBuilder
    pub fn new(block_restart_interval: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            restarts: vec![0],
            counter: 0,
            last_key: Vec::new(),
            block_restart_interval: block_restart_interval.max(1),
            num_entries: 0,
        }
    }

    /// Add a key-value pair to the block
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let mut shared = 0;

        if self.counter >= self.block_restart_interval {
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
            self.last_key.clear();
        } else if !self.last_key.is_empty() {
            shared = shared_prefix_len(&self.last_key, key);
        }

        let unshared = key.len() - shared;

        // shared | unshared | value_len | key_suffix | value
        self.buffer.put_u32_le(shared as u32);
        self.buffer.put_u32_le(unshared as u32);
        self.buffer.put_u32_le(value.len() as u32);
        self.buffer.put_slice(&key[shared..]);
        self.buffer.put_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
        self.num_entries += 1;
    }

    /// Finish building and return the block data
    pub fn finish(mut self) -> Bytes {
        for restart in &self.restarts {
            self.buffer.put_u32_le(*restart);
        }
        self.buffer.put_u32_le(self.restarts.len() as u32);
        self.buffer.freeze()
    }

    /// Get the current size of the block
    pub fn current_size(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    /// Number of entries added so far
    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    /// Check if the block is empty
    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }
}

fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Iterator over entries in a block
pub struct BlockIterator {
    block: Block,
    current: usize,
    key: Vec<u8>,
    value: Vec<u8>,
    valid: bool,
}

impl BlockIterator {
    fn new(block: Block) -> Self {
        Self { block, current: 0, key: Vec::new(), value: Vec::new(), valid: false }
    }

    /// Position before the first entry; the next `advance` yields it.
    pub fn seek_to_first(&mut self) {
        self.key.clear();
        self.current = self.block.restart_point(0);
        self.valid = self.current < self.block.restart_offset;
    }

    /// Move to the next entry. Returns false at the end of the block or on a
    /// malformed entry.
    pub fn advance(&mut self) -> bool {
        if self.current >= self.block.restart_offset {
            self.valid = false;
            return false;
        }
        self.parse_next_entry();
        self.valid
    }

    fn parse_next_entry(&mut self) {
        let data = &self.block.data[self.current..self.block.restart_offset];
        if data.len() < 12 {
            self.valid = false;
            return;
        }

        let mut cursor = data;
        let shared = cursor.get_u32_le() as usize;
        let unshared = cursor.get_u32_le() as usize;
        let value_len = cursor.get_u32_le() as usize;

        if shared > self.key.len() || cursor.len() < unshared + value_len {
            self.valid = false;
            return;
        }

        self.key.truncate(shared);
        self.key.extend_from_slice(&cursor[..unshared]);
        self.value.clear();
        self.value.extend_from_slice(&cursor[unshared..unshared + value_len]);

        self.current += 12 + unshared + value_len;
        self.valid = true;
    }

    /// Returns true if the iterator has consumed the whole block without
    /// hitting a malformed entry.
    pub fn exhausted_cleanly(&self) -> bool {
        self.current == self.block.restart_offset
    }

    /// Check if the iterator is valid
    pub fn valid(&self) -> bool {
        self.valid
    }

    /// Get the current key
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Get the current value
    pub fn value(&self) -> &[u8] {
        &self.value
    }
}
