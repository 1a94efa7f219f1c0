//! Error types for the ChainDb storage engine.

use std::io;
use thiserror::Error;

/// The result type used throughout ChainDb.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for ChainDb operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error occurred while creating, writing, syncing or closing a file.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Data corruption was detected.
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// The record stream feeding a flush reported an error.
    #[error("Input iterator error: {0}")]
    InputIterator(String),

    /// Keys reached the validator out of order.
    #[error("Key order violation: {0}")]
    OrderViolation(String),

    /// No free slot is available for a new flush generation.
    #[error("Slot pool exhausted: {0}")]
    PoolExhausted(String),

    /// Shipping a file to the next chain node failed after all retries.
    #[error("Replication of file {file_number} failed after {attempts} attempts: {reason}")]
    Replication {
        /// The file that could not be shipped.
        file_number: u64,
        /// Number of attempts made.
        attempts: u32,
        /// The last transport error.
        reason: String,
    },

    /// A checksum mismatch was detected.
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// The expected checksum value.
        expected: u32,
        /// The actual checksum value.
        actual: u32,
    },

    /// The requested item was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An invalid argument was provided.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The node is in an invalid state for the requested operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The item already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The operation was aborted by shutdown.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Creates a new corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Creates a new not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Creates a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Returns true for errors that indicate damaged or inconsistent data.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Error::Corruption(_)
                | Error::InputIterator(_)
                | Error::OrderViolation(_)
                | Error::ChecksumMismatch { .. }
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
