//! Table file writer.
//!
//! Every byte of a table file passes through a [`TableFileWriter`], which
//! stages it in an [`AlignedBuffer`] and tracks the whole-file checksum.
//!
//! - `Retain` keeps the complete file in memory until [`TableFileWriter::sync`]
//!   writes it with one aligned write. The buffer then seals into the bytes
//!   that get shipped.
//! - `Stream` writes aligned chunks as the buffer fills and keeps nothing.

use crate::error::Result;
use crate::ship::buffer::{AlignedBuffer, SealedBuffer};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// How the writer treats its staging buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    /// Keep every byte in memory for shipping.
    Retain,
    /// Drain full aligned chunks to disk.
    Stream,
}

/// Writes one table file through an aligned buffer.
#[derive(Debug)]
pub struct TableFileWriter {
    path: PathBuf,
    file: File,
    buffer: AlignedBuffer,
    mode: BufferMode,
    offset: u64,
    hasher: crc32fast::Hasher,
    use_fsync: bool,
    synced: bool,
}

impl TableFileWriter {
    /// Creates the file at `path`, truncating any previous content.
    pub fn create<P: AsRef<Path>>(
        path: P,
        mode: BufferMode,
        buffer_size: usize,
        alignment: usize,
        use_fsync: bool,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().write(true).create(true).truncate(true).open(&path)?;

        Ok(Self {
            path,
            file,
            buffer: AlignedBuffer::new(buffer_size, alignment),
            mode,
            offset: 0,
            hasher: crc32fast::Hasher::new(),
            use_fsync,
            synced: false,
        })
    }

    /// Appends bytes at the end of the file.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        self.hasher.update(data);
        self.offset += data.len() as u64;

        match self.mode {
            BufferMode::Retain => {
                if data.len() > self.buffer.remaining() {
                    let old = self.buffer.capacity();
                    self.buffer.grow(data.len());
                    log::warn!(
                        "Table {} outgrew its ship buffer, reallocated {} -> {} bytes",
                        self.path.display(),
                        old,
                        self.buffer.capacity()
                    );
                }
                self.buffer.push(data);
            }
            BufferMode::Stream => {
                let mut rest = data;
                while !rest.is_empty() {
                    let taken = self.buffer.push(rest);
                    rest = &rest[taken..];
                    if self.buffer.remaining() == 0 {
                        self.drain_aligned()?;
                    }
                }
            }
        }
        Ok(())
    }

    fn drain_aligned(&mut self) -> Result<()> {
        let n = self.buffer.aligned_len();
        if n > 0 {
            self.file.write_all(&self.buffer.as_slice()[..n])?;
            self.buffer.consume(n);
        }
        Ok(())
    }

    /// Number of bytes appended so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// crc32 over every byte appended so far.
    pub fn file_checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Path of the file being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Buffer mode of this writer.
    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    /// Writes the buffered tail as one zero padded aligned write, truncates the
    /// file to its logical size and makes it durable.
    pub fn sync(&mut self) -> Result<()> {
        if self.synced {
            return Ok(());
        }
        let tail = self.buffer.padded();
        self.file.write_all(tail)?;
        self.file.set_len(self.offset)?;
        if self.use_fsync {
            self.file.sync_all()?;
        } else {
            self.file.sync_data()?;
        }
        self.synced = true;
        Ok(())
    }

    /// Closes the file. In `Retain` mode the buffered bytes come back sealed,
    /// byte-identical to what was synced.
    pub fn close(self) -> Option<SealedBuffer> {
        let Self { file, buffer, mode, .. } = self;
        drop(file);
        match mode {
            BufferMode::Retain => Some(buffer.seal()),
            BufferMode::Stream => None,
        }
    }

    /// Closes and deletes the partial file.
    pub fn abandon(self) -> Result<()> {
        let Self { path, file, .. } = self;
        drop(file);
        remove_if_exists(&path)
    }
}

/// Removes a file, treating a missing file as success.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
