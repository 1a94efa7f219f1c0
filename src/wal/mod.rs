//! Append-only framed log.
//!
//! Payloads are written as crc32-checked records. Payloads larger than
//! [`record::MAX_RECORD_SIZE`] are split into fragments and reassembled on
//! read. A torn record at the tail of the log is dropped during recovery.
//!
//! ```rust,no_run
//! use chaindb::wal::{LogReader, LogWriter};
//!
//! # fn main() -> Result<(), chaindb::Error> {
//! let mut writer = LogWriter::open("slots.log")?;
//! writer.append(b"record")?;
//! writer.sync()?;
//!
//! let recovered = LogReader::open("slots.log")?.recover_all()?;
//! assert_eq!(recovered.entries.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod reader;
pub mod record;
pub mod writer;

pub use reader::{LogReader, Recovered};
pub use record::RecordType;
pub use writer::LogWriter;
