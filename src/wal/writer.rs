//! Log writer.

use super::record::{encode_into, RecordType, MAX_RECORD_SIZE};
use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Appends framed records to a log file.
pub struct LogWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    file_size: u64,
    scratch: Vec<u8>,
}

impl LogWriter {
    /// Opens the log in append mode, creating it if it doesn't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let file_size = file.metadata()?.len();

        Ok(Self { path, writer: BufWriter::new(file), file_size, scratch: Vec::new() })
    }

    /// Appends one payload. Payloads larger than a record are split into
    /// First/Middle/Last fragments.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        self.scratch.clear();
        let count = data.len().div_ceil(MAX_RECORD_SIZE);
        for (i, chunk) in data.chunks(MAX_RECORD_SIZE).enumerate() {
            encode_into(&mut self.scratch, RecordType::for_fragment(i, count), chunk);
        }

        self.writer.write_all(&self.scratch)?;
        self.file_size += self.scratch.len() as u64;
        Ok(())
    }

    /// Flushes buffered records and fsyncs the file.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Size of the log including buffered records.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}
