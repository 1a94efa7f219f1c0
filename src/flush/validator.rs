//! Output validator.
//!
//! Hashes the entries of a table as they are written, and again when the
//! finished file is read back, so that the two passes can be compared.

use crate::error::{Error, Result};
use crate::memtable::compare_internal_keys;
use std::cmp::Ordering;

/// Entry count and content hash of one validator pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorDigest {
    /// crc32 over every length-prefixed key and value.
    pub hash: u32,
    /// Number of entries added.
    pub entries: u64,
}

/// Streams (key, value) pairs, checking order and maintaining a running hash.
#[derive(Debug, Clone)]
pub struct OutputValidator {
    check_order: bool,
    hasher: crc32fast::Hasher,
    entries: u64,
    last_key: Option<Vec<u8>>,
}

impl OutputValidator {
    /// Creates a validator. With `check_order`, keys (encoded internal keys)
    /// must be strictly increasing in internal-key order.
    pub fn new(check_order: bool) -> Self {
        Self { check_order, hasher: crc32fast::Hasher::new(), entries: 0, last_key: None }
    }

    /// Adds one entry.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.check_order {
            if let Some(prev) = &self.last_key {
                if compare_internal_keys(key, prev) != Ordering::Greater {
                    return Err(Error::OrderViolation(format!(
                        "entry {} ({}) does not sort after {}",
                        self.entries,
                        printable(key),
                        printable(prev)
                    )));
                }
            }
            match &mut self.last_key {
                Some(last) => {
                    last.clear();
                    last.extend_from_slice(key);
                }
                None => self.last_key = Some(key.to_vec()),
            }
        }

        self.hasher.update(&(key.len() as u32).to_le_bytes());
        self.hasher.update(key);
        self.hasher.update(&(value.len() as u32).to_le_bytes());
        self.hasher.update(value);
        self.entries += 1;
        Ok(())
    }

    /// Current hash and entry count.
    pub fn digest(&self) -> ValidatorDigest {
        ValidatorDigest { hash: self.hasher.clone().finalize(), entries: self.entries }
    }

    /// Number of entries added.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Returns true if both validators saw the same entries.
    pub fn matches(&self, other: &OutputValidator) -> bool {
        self.digest() == other.digest()
    }
}

fn printable(key: &[u8]) -> String {
    String::from_utf8_lossy(key).escape_debug().to_string()
}
