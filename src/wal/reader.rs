//! Log reader for recovery.

use super::record::{decode, Decoded, RecordType};
use crate::error::{Error, Result};
use std::path::Path;

/// Payloads recovered from a log file.
#[derive(Debug, Default)]
pub struct Recovered {
    /// Complete payloads in write order.
    pub entries: Vec<Vec<u8>>,
    /// Length of the prefix holding complete payloads. Anything after it is a
    /// torn write and can be truncated away.
    pub valid_len: u64,
}

/// Reads a whole log file and reassembles its payloads.
pub struct LogReader {
    data: Vec<u8>,
    position: usize,
}

impl LogReader {
    /// Loads the log at `path`. A missing file reads as empty.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { data, position: 0 })
    }

    /// Reads the next complete payload, reassembling fragments.
    ///
    /// Returns `None` at the end of the log or at a torn tail.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>> {
        let mut assembled: Option<Vec<u8>> = None;
        let mut cursor = self.position;

        loop {
            let (record_type, data, consumed) = match decode(&self.data[cursor..])? {
                Decoded::Record { record_type, data, consumed } => (record_type, data, consumed),
                Decoded::Incomplete => return Ok(None),
            };
            cursor += consumed;

            match (record_type, assembled.take()) {
                (RecordType::Full, None) => {
                    self.position = cursor;
                    return Ok(Some(data.to_vec()));
                }
                (RecordType::First, None) => assembled = Some(data.to_vec()),
                (RecordType::Middle, Some(mut buf)) => {
                    buf.extend_from_slice(data);
                    assembled = Some(buf);
                }
                (RecordType::Last, Some(mut buf)) => {
                    buf.extend_from_slice(data);
                    self.position = cursor;
                    return Ok(Some(buf));
                }
                (t, _) => {
                    return Err(Error::corruption(format!(
                        "Unexpected {:?} record at offset {}",
                        t,
                        cursor - consumed
                    )))
                }
            }
        }
    }

    /// Offset just past the last complete payload read.
    pub fn position(&self) -> u64 {
        self.position as u64
    }

    /// Reads every complete payload.
    ///
    /// A torn record at the tail ends recovery; a checksum failure before the
    /// tail is corruption.
    pub fn recover_all(mut self) -> Result<Recovered> {
        let mut entries = Vec::new();
        while let Some(entry) = self.read_next()? {
            entries.push(entry);
        }
        if self.position < self.data.len() {
            log::warn!(
                "Ignoring {} bytes of incomplete log tail",
                self.data.len() - self.position
            );
        }
        Ok(Recovered { entries, valid_len: self.position() })
    }
}
