//! # Internal Key Format
//!
//! ```text
//! InternalKey:
//!   [user_key: bytes] [sequence: u64 LE] [type: u8]
//! ```
//!
//! ## Ordering
//!
//! InternalKeys are ordered by:
//! 1. user_key (ascending)
//! 2. sequence (descending - newer first)
//! 3. type (descending)
//!
//! The encoded form does not sort bytewise in this order (the sequence is
//! little-endian and descending), so encoded keys must be compared with
//! [`compare_internal_keys`].

use std::cmp::Ordering;

/// Size of the sequence and type trailer appended to every user key.
pub const INTERNAL_KEY_TRAILER: usize = 9;

/// The type of an entry in a memtable or table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueType {
    /// A tombstone indicating the key has been deleted
    Deletion = 0,

    /// A normal value
    Value = 1,

    /// A range tombstone; the value holds the exclusive end key
    RangeDeletion = 2,

    /// A reference to a value stored in a blob file
    BlobIndex = 3,
}

impl ValueType {
    /// Converts a u8 to a ValueType.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            2 => Some(ValueType::RangeDeletion),
            3 => Some(ValueType::BlobIndex),
            _ => None,
        }
    }

    /// Converts the ValueType to a u8.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Internal key used in memtables and table files.
///
/// The internal key consists of:
/// - User key: The key provided by the user
/// - Sequence number: A monotonically increasing number for MVCC
/// - Value type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InternalKey {
    user_key: Vec<u8>,
    sequence: u64,
    value_type: ValueType,
}

impl InternalKey {
    /// Creates a new InternalKey.
    ///
    /// # Example
    ///
    /// ```rust
    /// use chaindb::memtable::{InternalKey, ValueType};
    ///
    /// let key = InternalKey::new(b"user_key".to_vec(), 42, ValueType::Value);
    /// assert_eq!(key.sequence(), 42);
    /// ```
    pub fn new(user_key: Vec<u8>, sequence: u64, value_type: ValueType) -> Self {
        Self { user_key, sequence, value_type }
    }

    /// Returns the user key.
    pub fn user_key(&self) -> &[u8] {
        &self.user_key
    }

    /// Returns the sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the value type.
    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    /// Encodes the InternalKey into bytes.
    ///
    /// Format: [user_key][sequence: 8 bytes][type: 1 byte]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_size());
        buf.extend_from_slice(&self.user_key);
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.push(self.value_type.as_u8());
        buf
    }

    /// Decodes an InternalKey from bytes.
    ///
    /// Returns None if the data is too short or the value type is invalid.
    pub fn decode(data: &[u8]) -> Option<Self> {
        let (user_key, sequence, type_byte) = split_encoded(data)?;
        Some(Self {
            user_key: user_key.to_vec(),
            sequence,
            value_type: ValueType::from_u8(type_byte)?,
        })
    }

    /// Returns the total encoded size of this InternalKey.
    pub fn encoded_size(&self) -> usize {
        self.user_key.len() + INTERNAL_KEY_TRAILER
    }
}

impl PartialOrd for InternalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.user_key
            .cmp(&other.user_key)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| other.value_type.cmp(&self.value_type))
    }
}

fn split_encoded(data: &[u8]) -> Option<(&[u8], u64, u8)> {
    if data.len() < INTERNAL_KEY_TRAILER {
        return None;
    }
    let user_len = data.len() - INTERNAL_KEY_TRAILER;
    let sequence = u64::from_le_bytes(data[user_len..user_len + 8].try_into().ok()?);
    Some((&data[..user_len], sequence, data[user_len + 8]))
}

/// Returns the user key part of an encoded internal key.
pub fn user_key_of(encoded: &[u8]) -> &[u8] {
    split_encoded(encoded).map(|(user, _, _)| user).unwrap_or(encoded)
}

/// Compares two encoded internal keys in internal-key order.
///
/// Inputs too short to carry a trailer sort bytewise before well-formed keys
/// with the same prefix.
pub fn compare_internal_keys(a: &[u8], b: &[u8]) -> Ordering {
    match (split_encoded(a), split_encoded(b)) {
        (Some((ua, sa, ta)), Some((ub, sb, tb))) => {
            ua.cmp(ub).then_with(|| sb.cmp(&sa)).then_with(|| tb.cmp(&ta))
        }
        _ => a.cmp(b),
    }
}
