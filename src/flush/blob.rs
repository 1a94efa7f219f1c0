//! Blob files for large values.
//!
//! A flush with blob files enabled moves every value of at least
//! `min_blob_size` bytes into `{file_number:06}.blob` and stores a
//! [`BlobIndex`] in the table instead. Blob files stay on the node that
//! wrote them.
//!
//! ```text
//! [magic: u32]
//! [key_len: u32][value_len: u32][key][value][crc32(value): u32]   per record
//! ```

use crate::error::{Error, Result};
use crate::sstable::writer::remove_if_exists;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const BLOB_MAGIC: u32 = 0x424c_4f42;
const BLOB_HEADER_SIZE: u64 = 4;

/// File name of blob file `file_number`.
pub fn blob_file_name(file_number: u64) -> String {
    format!("{:06}.blob", file_number)
}

/// Location of a value inside a blob file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobIndex {
    /// Blob file holding the value.
    pub file_number: u64,
    /// Offset of the value bytes.
    pub offset: u64,
    /// Length of the value.
    pub size: u64,
}

impl BlobIndex {
    /// Encoded size of a blob index.
    pub const ENCODED_LEN: usize = 24;

    /// Encodes the index as stored in the table.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
        buf.extend_from_slice(&self.file_number.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Decodes an index read from the table.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != Self::ENCODED_LEN {
            return Err(Error::corruption("Blob index has the wrong size"));
        }
        let field = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[i * 8..i * 8 + 8]);
            u64::from_le_bytes(b)
        };
        Ok(Self { file_number: field(0), offset: field(1), size: field(2) })
    }
}

/// A finished blob file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobFileAddition {
    /// File number shared with the table file.
    pub file_number: u64,
    /// Number of values stored.
    pub blob_count: u64,
    /// Total value bytes stored.
    pub blob_bytes: u64,
    /// crc32 over all values.
    pub checksum: u32,
}

/// Writes the blob file of one flush.
pub struct BlobFileBuilder {
    file_number: u64,
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    min_blob_size: usize,
    offset: u64,
    blob_count: u64,
    blob_bytes: u64,
    hasher: crc32fast::Hasher,
}

impl BlobFileBuilder {
    /// Prepares blob file `file_number` in `dir`. The file is created on the
    /// first large value.
    pub fn new(dir: &Path, file_number: u64, min_blob_size: usize) -> Self {
        Self {
            file_number,
            path: dir.join(blob_file_name(file_number)),
            writer: None,
            min_blob_size,
            offset: BLOB_HEADER_SIZE,
            blob_count: 0,
            blob_bytes: 0,
            hasher: crc32fast::Hasher::new(),
        }
    }

    /// Returns true if `value` belongs in the blob file.
    pub fn wants(&self, value: &[u8]) -> bool {
        value.len() >= self.min_blob_size
    }

    /// Appends a value and returns where it was stored.
    pub fn add(&mut self, user_key: &[u8], value: &[u8]) -> Result<BlobIndex> {
        if self.writer.is_none() {
            let mut writer = BufWriter::new(File::create(&self.path)?);
            writer.write_all(&BLOB_MAGIC.to_le_bytes())?;
            self.writer = Some(writer);
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::internal("blob writer missing after creation"))?;

        writer.write_all(&(user_key.len() as u32).to_le_bytes())?;
        writer.write_all(&(value.len() as u32).to_le_bytes())?;
        writer.write_all(user_key)?;
        writer.write_all(value)?;
        writer.write_all(&crc32fast::hash(value).to_le_bytes())?;

        let value_offset = self.offset + 8 + user_key.len() as u64;
        self.offset = value_offset + value.len() as u64 + 4;
        self.blob_count += 1;
        self.blob_bytes += value.len() as u64;
        self.hasher.update(value);

        Ok(BlobIndex { file_number: self.file_number, offset: value_offset, size: value.len() as u64 })
    }

    /// Number of values added.
    pub fn blob_count(&self) -> u64 {
        self.blob_count
    }

    /// Syncs the blob file. Returns `None` if no value was written.
    pub fn finish(self) -> Result<Option<BlobFileAddition>> {
        let Some(writer) = self.writer else {
            return Ok(None);
        };
        let file = writer.into_inner().map_err(|e| Error::Io(e.into_error()))?;
        file.sync_all()?;
        Ok(Some(BlobFileAddition {
            file_number: self.file_number,
            blob_count: self.blob_count,
            blob_bytes: self.blob_bytes,
            checksum: self.hasher.finalize(),
        }))
    }

    /// Deletes the partial blob file.
    pub fn abandon(self) -> Result<()> {
        drop(self.writer);
        remove_if_exists(&self.path)
    }
}

/// Reads one value back from a blob file.
pub fn read_blob(dir: &Path, index: &BlobIndex) -> Result<Vec<u8>> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = File::open(dir.join(blob_file_name(index.file_number)))?;
    file.seek(SeekFrom::Start(index.offset))?;
    let mut value = vec![0u8; index.size as usize];
    file.read_exact(&mut value)?;
    let mut crc = [0u8; 4];
    file.read_exact(&mut crc)?;

    let expected = u32::from_le_bytes(crc);
    let actual = crc32fast::hash(&value);
    if expected != actual {
        return Err(Error::ChecksumMismatch { expected, actual });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_blob_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut builder = BlobFileBuilder::new(dir.path(), 12, 100);

        assert!(!builder.wants(&[0u8; 99]));
        assert!(builder.wants(&[0u8; 100]));

        let big = vec![0xABu8; 500];
        let index = builder.add(b"k1", &big).unwrap();
        let index2 = builder.add(b"k2", &[1u8; 200]).unwrap();
        assert_eq!(builder.blob_count(), 2);

        let addition = builder.finish().unwrap().unwrap();
        assert_eq!(addition.blob_bytes, 700);

        assert_eq!(read_blob(dir.path(), &index).unwrap(), big);
        assert_eq!(read_blob(dir.path(), &index2).unwrap(), vec![1u8; 200]);
        assert_eq!(BlobIndex::decode(&index.encode()).unwrap(), index);
    }

    #[test]
    fn test_unused_blob_file_not_created() {
        let dir = TempDir::new().unwrap();
        let builder = BlobFileBuilder::new(dir.path(), 3, 100);
        assert!(builder.finish().unwrap().is_none());
        assert!(!dir.path().join(blob_file_name(3)).exists());
    }

    #[test]
    fn test_abandon_removes_blob_file() {
        let dir = TempDir::new().unwrap();
        let mut builder = BlobFileBuilder::new(dir.path(), 4, 1);
        builder.add(b"k", b"value").unwrap();
        builder.abandon().unwrap();
        assert!(!dir.path().join(blob_file_name(4)).exists());
    }
}
