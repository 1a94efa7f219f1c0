//! Log record framing.
//!
//! Each physical record consists of:
//! - Checksum (4 bytes): CRC32 of type and data
//! - Length (2 bytes): Length of the data
//! - Type (1 byte): Fragment type (Full, First, Middle, Last)
//! - Data (variable)

use crate::error::{Error, Result};
use bytes::{Buf, BufMut};
use crc32fast::Hasher;

/// Maximum size of a single record's data portion
pub const MAX_RECORD_SIZE: usize = 32 * 1024; // 32KB

/// Size of the record header (checksum + length + type)
pub const HEADER_SIZE: usize = 7;

/// Fragment types for payloads larger than one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Complete payload in one record
    Full = 1,
    /// First fragment
    First = 2,
    /// Middle fragment
    Middle = 3,
    /// Last fragment
    Last = 4,
}

impl RecordType {
    /// Convert from u8 to RecordType
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RecordType::Full),
            2 => Ok(RecordType::First),
            3 => Ok(RecordType::Middle),
            4 => Ok(RecordType::Last),
            _ => Err(Error::corruption(format!("Invalid record type: {}", value))),
        }
    }

    /// Fragment type of chunk `index` out of `count`.
    pub fn for_fragment(index: usize, count: usize) -> Self {
        match (index, count) {
            (_, 1) => RecordType::Full,
            (0, _) => RecordType::First,
            (i, n) if i + 1 == n => RecordType::Last,
            _ => RecordType::Middle,
        }
    }
}

/// Outcome of decoding one record from a byte slice.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<'a> {
    /// A valid record and the number of bytes it occupied.
    Record {
        /// Fragment type.
        record_type: RecordType,
        /// Payload fragment.
        data: &'a [u8],
        /// Header plus data length.
        consumed: usize,
    },
    /// The slice ends inside the record (torn write at the log tail).
    Incomplete,
}

/// Appends one framed record to `out`.
///
/// Format: [checksum: u32][length: u16][type: u8][data: bytes]
pub fn encode_into(out: &mut Vec<u8>, record_type: RecordType, data: &[u8]) {
    debug_assert!(data.len() <= MAX_RECORD_SIZE);
    out.reserve(HEADER_SIZE + data.len());
    out.put_u32_le(checksum(record_type, data));
    out.put_u16_le(data.len() as u16);
    out.put_u8(record_type as u8);
    out.put_slice(data);
}

/// Decodes the record at the start of `buf`.
pub fn decode(buf: &[u8]) -> Result<Decoded<'_>> {
    if buf.len() < HEADER_SIZE {
        return Ok(Decoded::Incomplete);
    }
    let mut header = &buf[..HEADER_SIZE];
    let stored = header.get_u32_le();
    let length = header.get_u16_le() as usize;
    let record_type = RecordType::from_u8(header.get_u8())?;

    let consumed = HEADER_SIZE + length;
    if buf.len() < consumed {
        return Ok(Decoded::Incomplete);
    }
    let data = &buf[HEADER_SIZE..consumed];

    let computed = checksum(record_type, data);
    if stored != computed {
        return Err(Error::ChecksumMismatch { expected: stored, actual: computed });
    }
    Ok(Decoded::Record { record_type, data, consumed })
}

fn checksum(record_type: RecordType, data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&[record_type as u8]);
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_encode_decode() {
        let mut buf = Vec::new();
        encode_into(&mut buf, RecordType::Full, b"hello world");

        match decode(&buf).unwrap() {
            Decoded::Record { record_type, data, consumed } => {
                assert_eq!(record_type, RecordType::Full);
                assert_eq!(data, b"hello world");
                assert_eq!(consumed, buf.len());
            }
            Decoded::Incomplete => panic!("expected a record"),
        }
    }

    #[test]
    fn test_fragment_types() {
        assert_eq!(RecordType::for_fragment(0, 1), RecordType::Full);
        assert_eq!(RecordType::for_fragment(0, 3), RecordType::First);
        assert_eq!(RecordType::for_fragment(1, 3), RecordType::Middle);
        assert_eq!(RecordType::for_fragment(2, 3), RecordType::Last);
    }

    #[test]
    fn test_checksum_validation() {
        let mut buf = Vec::new();
        encode_into(&mut buf, RecordType::Full, b"test data");
        buf[HEADER_SIZE] ^= 0xFF;

        assert!(matches!(decode(&buf), Err(Error::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_record_is_incomplete() {
        let mut buf = Vec::new();
        encode_into(&mut buf, RecordType::Full, b"some payload");

        assert_eq!(decode(&buf[..3]).unwrap(), Decoded::Incomplete);
        assert_eq!(decode(&buf[..buf.len() - 1]).unwrap(), Decoded::Incomplete);
    }

    #[test]
    fn test_invalid_type() {
        let mut buf = Vec::new();
        encode_into(&mut buf, RecordType::Full, b"x");
        buf[6] = 9;
        assert!(matches!(decode(&buf), Err(Error::Corruption(_))));
    }
}
