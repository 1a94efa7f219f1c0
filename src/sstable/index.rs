//! Index block implementation for table files.
//!
//! The index block lists every data block in file order together with the
//! last key stored in it.

use crate::error::{Error, Result};
use crate::sstable::block::{Block, BlockBuilder, BlockIterator};
use crate::sstable::footer::BlockHandle;
use bytes::Bytes;

/// IndexEntry represents a single entry in the index block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// The last key in the data block
    pub key: Vec<u8>,
    /// Handle to the data block
    pub handle: BlockHandle,
}

impl IndexEntry {
    /// Create a new IndexEntry
    pub fn new(key: Vec<u8>, handle: BlockHandle) -> Self {
        Self { key, handle }
    }
}

/// Decoded index block.
#[derive(Debug)]
pub struct IndexBlock {
    block: Block,
}

impl IndexBlock {
    /// Create a new IndexBlock from raw data
    pub fn new(data: Bytes) -> Result<Self> {
        Ok(Self { block: Block::new(data)? })
    }

    /// Create an iterator over all index entries
    pub fn iter(&self) -> IndexIterator {
        IndexIterator { iter: self.block.iter() }
    }

    /// All entries, in file order.
    pub fn entries(&self) -> Result<Vec<IndexEntry>> {
        let mut iter = self.iter();
        iter.seek_to_first();
        let mut entries = Vec::new();
        while iter.advance() {
            entries.push(iter.entry()?);
        }
        if !iter.iter.exhausted_cleanly() {
            return Err(Error::corruption("Malformed index block"));
        }
        Ok(entries)
    }

    /// Get the number of entries in the index
    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut iter = self.block.iter();
        iter.seek_to_first();
        while iter.advance() {
            count += 1;
        }
        count
    }

    /// Check if the index is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// IndexBlockBuilder builds an index block.
pub struct IndexBlockBuilder {
    builder: BlockBuilder,
}

impl IndexBlockBuilder {
    /// Create a new IndexBlockBuilder
    pub fn new() -> Self {
        Self { builder: BlockBuilder::new(1) }
    }

    /// Add an index entry
    pub fn add_entry(&mut self, entry: &IndexEntry) {
        self.builder.add(&entry.key, &entry.handle.encode());
    }

    /// Finish building and return the block data
    pub fn finish(self) -> Bytes {
        self.builder.finish()
    }

    /// Check if the builder is empty
    pub fn is_empty(&self) -> bool {
        self.builder.is_empty()
    }
}

impl Default for IndexBlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over index entries
pub struct IndexIterator {
    iter: BlockIterator,
}

impl IndexIterator {
    /// Seek to the first entry
    pub fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    /// Move to the next entry
    pub fn advance(&mut self) -> bool {
        self.iter.advance()
    }

    /// Check if the iterator is valid
    pub fn valid(&self) -> bool {
        self.iter.valid()
    }

    /// Get the current entry
    pub fn entry(&self) -> Result<IndexEntry> {
        if !self.valid() {
            return Err(Error::invalid_state("Iterator not valid"));
        }
        let handle = BlockHandle::decode(self.iter.value())?;
        Ok(IndexEntry::new(self.iter.key().to_vec(), handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_block_builder() {
        let mut builder = IndexBlockBuilder::new();
        assert!(builder.is_empty());

        builder.add_entry(&IndexEntry::new(b"apple".to_vec(), BlockHandle::new(0, 100)));
        builder.add_entry(&IndexEntry::new(b"banana".to_vec(), BlockHandle::new(100, 150)));
        builder.add_entry(&IndexEntry::new(b"cherry".to_vec(), BlockHandle::new(250, 200)));

        let index = IndexBlock::new(builder.finish()).unwrap();
        assert_eq!(index.len(), 3);

        let entries = index.entries().unwrap();
        assert_eq!(entries[1].key, b"banana");
        assert_eq!(entries[2].handle, BlockHandle::new(250, 200));
    }

    #[test]
    fn test_index_iterator() {
        let mut builder = IndexBlockBuilder::new();
        builder.add_entry(&IndexEntry::new(b"apple".to_vec(), BlockHandle::new(0, 100)));
        builder.add_entry(&IndexEntry::new(b"banana".to_vec(), BlockHandle::new(100, 150)));

        let index = IndexBlock::new(builder.finish()).unwrap();
        let mut iter = index.iter();
        iter.seek_to_first();

        assert!(iter.advance());
        assert_eq!(iter.entry().unwrap().handle.offset, 0);

        assert!(iter.advance());
        assert_eq!(iter.entry().unwrap().key, b"banana");

        assert!(!iter.advance());
        assert!(iter.entry().is_err());
    }
}
