//! Table file reader.
//!
//! Sequential access to a finished table: data entries, range tombstones and
//! the identity recomputed from the file contents.

use crate::error::{Error, Result};
use crate::flush::range_del::RangeTombstone;
use crate::memtable::{compare_internal_keys, InternalKey, ValueType};
use crate::sstable::block::{Block, BlockIterator, BLOCK_TRAILER_SIZE};
use crate::sstable::builder::FileIdentity;
use crate::sstable::footer::{BlockHandle, Footer};
use crate::sstable::index::IndexBlock;
use crate::sstable::{CompressionType, CHECKSUM_FUNC_NAME, FOOTER_SIZE};
use bytes::Bytes;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

/// SSTableReader provides read access to a table file.
///
/// ```no_run
/// use chaindb::sstable::SSTableReader;
///
/// let reader = SSTableReader::open("000001.sst").unwrap();
/// let mut iter = reader.iter().unwrap();
/// iter.seek_to_first().unwrap();
/// while iter.advance().unwrap() {
///     println!("{:?}", iter.key());
/// }
/// ```
#[derive(Debug)]
pub struct SSTableReader {
    file: Arc<File>,
    index_block: IndexBlock,
    range_tombstones: Vec<RangeTombstone>,
    file_size: u64,
}

impl SSTableReader {
    /// Open a table file for reading
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)?;

        let file_size = file.metadata()?.len();
        if file_size < FOOTER_SIZE as u64 {
            return Err(Error::corruption("File too small to be a valid table"));
        }

        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer_bytes = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer_bytes)?;
        let footer = Footer::decode(&footer_bytes)?;

        for handle in [&footer.range_del_handle, &footer.index_handle] {
            if handle.end_offset() > file_size - FOOTER_SIZE as u64 {
                return Err(Error::corruption("Block handle points past the footer"));
            }
        }

        let index_block = IndexBlock::new(Self::read_block_data(&mut file, &footer.index_handle)?)?;
        let range_del_block =
            Block::new(Self::read_block_data(&mut file, &footer.range_del_handle)?)?;
        let range_tombstones = Self::decode_range_tombstones(&range_del_block)?;

        Ok(Self { file: Arc::new(file), index_block, range_tombstones, file_size })
    }

    fn decode_range_tombstones(block: &Block) -> Result<Vec<RangeTombstone>> {
        let mut iter = block.iter();
        iter.seek_to_first();
        let mut tombstones = Vec::new();
        while iter.advance() {
            tombstones.push(RangeTombstone::decode(iter.key(), iter.value())?);
        }
        if !iter.exhausted_cleanly() {
            return Err(Error::corruption("Malformed range-deletion block"));
        }
        Ok(tombstones)
    }

    /// Read one block, verify its checksum and decompress it
    fn read_block_data(file: &mut File, handle: &BlockHandle) -> Result<Bytes> {
        file.seek(SeekFrom::Start(handle.offset))?;

        let total_size = handle.size as usize;
        if total_size < BLOCK_TRAILER_SIZE {
            return Err(Error::corruption("Block size too small"));
        }

        let mut buffer = vec![0u8; total_size];
        file.read_exact(&mut buffer)?;

        // [data...][compression_type: 1 byte][checksum: 4 bytes]
        let data_size = total_size - BLOCK_TRAILER_SIZE;
        let (data, trailer) = buffer.split_at(data_size);
        let stored_checksum = u32::from_le_bytes([trailer[1], trailer[2], trailer[3], trailer[4]]);

        let computed_checksum = crc32fast::hash(data);
        if computed_checksum != stored_checksum {
            return Err(Error::ChecksumMismatch {
                expected: stored_checksum,
                actual: computed_checksum,
            });
        }

        let compression = CompressionType::from_u8(trailer[0])
            .ok_or_else(|| Error::corruption("Invalid compression type"))?;

        let decompressed = match compression {
            CompressionType::None => data.to_vec(),
            #[cfg(feature = "snappy")]
            CompressionType::Snappy => snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|e| Error::corruption(format!("Decompression failed: {}", e)))?,
        };

        Ok(Bytes::from(decompressed))
    }

    fn read_block_with_handle(file: &Arc<File>, handle: &BlockHandle) -> Result<Bytes> {
        let mut file_clone = file.try_clone()?;
        Self::read_block_data(&mut file_clone, handle)
    }

    /// Get the number of data blocks
    pub fn num_blocks(&self) -> usize {
        self.index_block.len()
    }

    /// Get the file size
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Range tombstones stored in the file, in write order.
    pub fn range_tombstones(&self) -> &[RangeTombstone] {
        &self.range_tombstones
    }

    /// Create an iterator over all data entries
    pub fn iter(&self) -> Result<SSTableIterator> {
        SSTableIterator::new(self)
    }

    /// Reads every data entry into memory.
    pub fn entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut iter = self.iter()?;
        iter.seek_to_first()?;
        let mut entries = Vec::new();
        while iter.advance()? {
            entries.push((iter.key().to_vec(), iter.value().to_vec()));
        }
        Ok(entries)
    }

    /// Recomputes the identity of the file from its contents.
    ///
    /// `file_bytes` are the raw file contents, used for the file checksum.
    pub fn describe(&self, file_number: u64, file_bytes: &[u8]) -> Result<FileIdentity> {
        let mut identity = FileIdentity {
            file_number,
            file_size: self.file_size,
            smallest_key: Vec::new(),
            largest_key: Vec::new(),
            smallest_seqno: u64::MAX,
            largest_seqno: 0,
            num_entries: 0,
            num_deletions: 0,
            num_range_deletions: self.range_tombstones.len() as u64,
            file_checksum: crc32fast::hash(file_bytes),
            checksum_func_name: CHECKSUM_FUNC_NAME.to_string(),
            marked_for_compaction: false,
        };

        let mut observe = |smallest: Vec<u8>, largest: Vec<u8>, seq: u64| {
            if identity.smallest_key.is_empty()
                || compare_internal_keys(&smallest, &identity.smallest_key) == Ordering::Less
            {
                identity.smallest_key = smallest;
            }
            if identity.largest_key.is_empty()
                || compare_internal_keys(&largest, &identity.largest_key) == Ordering::Greater
            {
                identity.largest_key = largest;
            }
            identity.smallest_seqno = identity.smallest_seqno.min(seq);
            identity.largest_seqno = identity.largest_seqno.max(seq);
        };

        let mut num_entries = 0;
        let mut num_deletions = 0;
        let mut iter = self.iter()?;
        iter.seek_to_first()?;
        while iter.advance()? {
            let ikey = InternalKey::decode(iter.key())
                .ok_or_else(|| Error::corruption("Table entry without a valid internal key"))?;
            num_entries += 1;
            if ikey.value_type() == ValueType::Deletion {
                num_deletions += 1;
            }
            observe(iter.key().to_vec(), iter.key().to_vec(), ikey.sequence());
        }
        for t in &self.range_tombstones {
            observe(t.smallest_key().encode(), t.largest_key().encode(), t.sequence);
        }

        identity.num_entries = num_entries;
        identity.num_deletions = num_deletions;
        if num_entries == 0 && identity.num_range_deletions == 0 {
            identity.smallest_seqno = 0;
        }
        Ok(identity)
    }
}

/// Iterator over all data entries of a table
pub struct SSTableIterator {
    file: Arc<File>,
    handles: Vec<BlockHandle>,
    current_block_index: usize,
    current_block_iter: Option<BlockIterator>,
}

impl SSTableIterator {
    fn new(reader: &SSTableReader) -> Result<Self> {
        let handles = reader.index_block.entries()?.into_iter().map(|e| e.handle).collect();
        Ok(Self {
            file: Arc::clone(&reader.file),
            handles,
            current_block_index: 0,
            current_block_iter: None,
        })
    }

    /// Seek to the first entry
    pub fn seek_to_first(&mut self) -> Result<()> {
        self.current_block_index = 0;
        self.load_current_block()
    }

    fn load_current_block(&mut self) -> Result<()> {
        self.current_block_iter = match self.handles.get(self.current_block_index) {
            Some(handle) => {
                let block = Block::new(SSTableReader::read_block_with_handle(&self.file, handle)?)?;
                let mut iter = block.iter();
                iter.seek_to_first();
                Some(iter)
            }
            None => None,
        };
        Ok(())
    }

    /// Move to the next entry
    pub fn advance(&mut self) -> Result<bool> {
        loop {
            let Some(iter) = self.current_block_iter.as_mut() else {
                return Ok(false);
            };
            if iter.advance() {
                return Ok(true);
            }
            if !iter.exhausted_cleanly() {
                return Err(Error::corruption(format!(
                    "Malformed entry in data block {}",
                    self.current_block_index
                )));
            }
            self.current_block_index += 1;
            self.load_current_block()?;
        }
    }

    /// Check if the iterator is valid
    pub fn valid(&self) -> bool {
        self.current_block_iter.as_ref().map(|i| i.valid()).unwrap_or(false)
    }

    /// Get the current key
    pub fn key(&self) -> &[u8] {
        self.current_block_iter.as_ref().map(|i| i.key()).unwrap_or(&[])
    }

    /// Get the current value
    pub fn value(&self) -> &[u8] {
        self.current_block_iter.as_ref().map(|i| i.value()).unwrap_or(&[])
    }
}
