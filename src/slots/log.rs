//! Slot recovery log.
//!
//! Every commit, acknowledgement and release of a committed slot appends a
//! [`SlotLogRecord`] to `SLOTMAP.log` and syncs it before the state change
//! becomes visible. Replaying the log rebuilds every column family's slot map
//! after a restart.

use crate::error::Result;
use crate::wal::{LogReader, LogWriter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Name of the slot recovery log inside the data directory.
pub const SLOT_LOG_FILE: &str = "SLOTMAP.log";

/// What happened to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotLogKind {
    /// The slot now holds a durable file.
    Commit,
    /// The next node acknowledged the file.
    Acknowledge,
    /// The file was removed and the slot is free again.
    Release,
}

/// One recovery log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLogRecord {
    /// Kind of transition.
    pub kind: SlotLogKind,
    /// Column family owning the slot.
    pub cf_id: u32,
    /// Index of the slot in the pool.
    pub slot_index: u64,
    /// File number of the slot.
    pub file_number: u64,
    /// Generation holding the slot.
    pub generation: u64,
    /// Pool wraparound count of the generation.
    pub epoch: u64,
}

/// Append-only log shared by the slot allocators of all column families.
pub struct SlotLog {
    path: PathBuf,
    writer: Mutex<LogWriter>,
}

impl SlotLog {
    /// Opens the log in `dir` and returns the records written before.
    ///
    /// A torn record at the tail is truncated away so that new records
    /// follow the last complete one.
    pub fn open(dir: &Path) -> Result<(Self, Vec<SlotLogRecord>)> {
        let path = dir.join(SLOT_LOG_FILE);
        let recovered = LogReader::open(&path)?.recover_all()?;

        if path.exists() {
            let file = OpenOptions::new().write(true).open(&path)?;
            if file.metadata()?.len() > recovered.valid_len {
                file.set_len(recovered.valid_len)?;
                file.sync_all()?;
            }
        }

        let records = recovered
            .entries
            .iter()
            .map(|entry| bincode::deserialize::<SlotLogRecord>(entry))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        log::debug!("Recovered {} slot log records from {}", records.len(), path.display());

        let writer = LogWriter::open(&path)?;
        Ok((Self { path, writer: Mutex::new(writer) }, records))
    }

    /// Appends `record` and syncs the log.
    pub fn append(&self, record: &SlotLogRecord) -> Result<()> {
        let encoded = bincode::serialize(record)?;
        let mut writer = self.writer.lock();
        writer.append(&encoded)?;
        writer.sync()
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the log in bytes.
    pub fn size(&self) -> u64 {
        self.writer.lock().file_size()
    }
}

impl std::fmt::Debug for SlotLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotLog").field("path", &self.path).finish()
    }
}
