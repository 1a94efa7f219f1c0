//! Aligned ship buffer.
//!
//! A flush writes its table bytes into one [`AlignedBuffer`]. The start of the
//! usable region and its capacity are multiples of the I/O alignment, and
//! every write handed to the file system covers a whole number of aligned
//! blocks (the tail is zero padded and the file truncated afterwards).
//!
//! Once the table is finished the buffer is sealed into a [`SealedBuffer`],
//! a read-only reference-counted view shared by the local file and the ship
//! job. No further copy is made between the bytes synced locally and the
//! bytes shipped.

use bytes::Bytes;

/// Buffer size used by nodes that stream table bytes to disk instead of
/// retaining them for shipping.
pub const MIN_STREAM_BUFFER: usize = 64 * 1024;

/// Rounds `size` up to a multiple of `alignment`.
pub fn align_up(size: usize, alignment: usize) -> usize {
    size.div_ceil(alignment) * alignment
}

/// Exclusively owned, alignment-compliant byte buffer.
pub struct AlignedBuffer {
    storage: Vec<u8>,
    offset: usize,
    len: usize,
    capacity: usize,
    alignment: usize,
}

impl AlignedBuffer {
    /// Allocates a zeroed buffer of at least `capacity` bytes.
    ///
    /// `alignment` must be a power of two.
    pub fn new(capacity: usize, alignment: usize) -> Self {
        let alignment = alignment.max(1);
        let capacity = align_up(capacity.max(1), alignment);
        let storage = vec![0u8; capacity + alignment];
        let offset = match storage.as_ptr().align_offset(alignment) {
            o if o < alignment => o,
            _ => 0,
        };
        Self { storage, offset, len: 0, capacity, alignment }
    }

    /// Number of bytes written.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Usable capacity, a multiple of the alignment.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Space left before the buffer is full.
    pub fn remaining(&self) -> usize {
        self.capacity - self.len
    }

    /// I/O alignment of this buffer.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Returns true if the first usable byte sits on an aligned address.
    pub fn is_aligned(&self) -> bool {
        self.as_slice().as_ptr() as usize % self.alignment == 0
    }

    /// The written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    /// Copies as much of `data` as fits and returns the number of bytes taken.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining());
        let start = self.offset + self.len;
        self.storage[start..start + n].copy_from_slice(&data[..n]);
        self.len += n;
        n
    }

    /// Reallocates so that at least `additional` more bytes fit.
    ///
    /// The new buffer doubles the capacity when that is enough.
    pub fn grow(&mut self, additional: usize) {
        let wanted = (self.len + additional).max(self.capacity * 2);
        let mut grown = AlignedBuffer::new(wanted, self.alignment);
        grown.push(self.as_slice());
        *self = grown;
    }

    /// Length of the longest aligned prefix of the written bytes.
    pub fn aligned_len(&self) -> usize {
        self.len / self.alignment * self.alignment
    }

    /// Drops the first `n` bytes and moves the rest to the front.
    ///
    /// `n` must be a multiple of the alignment so that the front stays aligned.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        let start = self.offset;
        self.storage.copy_within(start + n..start + self.len, start);
        self.len -= n;
    }

    /// Zero fills up to the next alignment boundary and returns the padded
    /// bytes. The logical length is unchanged.
    pub fn padded(&mut self) -> &[u8] {
        let padded_len = align_up(self.len, self.alignment);
        let start = self.offset;
        self.storage[start + self.len..start + padded_len].fill(0);
        &self.storage[start..start + padded_len]
    }

    /// Freezes the written bytes into a shared read-only view without copying.
    pub fn seal(self) -> SealedBuffer {
        let Self { storage, offset, len, alignment, .. } = self;
        SealedBuffer { bytes: Bytes::from(storage).slice(offset..offset + len), alignment }
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("alignment", &self.alignment)
            .finish()
    }
}

/// Read-only table bytes shared between the local file and the ship job.
#[derive(Debug, Clone)]
pub struct SealedBuffer {
    bytes: Bytes,
    alignment: usize,
}

impl SealedBuffer {
    /// The table bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Another handle to the same bytes.
    pub fn share(&self) -> Bytes {
        self.bytes.clone()
    }

    /// Logical size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Alignment of the buffer the bytes were written into.
    pub fn alignment(&self) -> usize {
        self.alignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_aligned() {
        let buf = AlignedBuffer::new(10_000, 4096);
        assert_eq!(buf.capacity(), 12_288);
        assert!(buf.is_aligned());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_push_until_full() {
        let mut buf = AlignedBuffer::new(512, 512);
        assert_eq!(buf.push(&[1u8; 300]), 300);
        assert_eq!(buf.push(&[2u8; 300]), 212);
        assert_eq!(buf.remaining(), 0);
        assert_eq!(buf.as_slice()[299], 1);
        assert_eq!(buf.as_slice()[300], 2);
    }

    #[test]
    fn test_grow_keeps_content() {
        let mut buf = AlignedBuffer::new(512, 512);
        buf.push(b"hello");
        buf.grow(4096);

        assert!(buf.capacity() >= 4096 + 5);
        assert_eq!(buf.capacity() % 512, 0);
        assert!(buf.is_aligned());
        assert_eq!(buf.as_slice(), b"hello");
    }

    #[test]
    fn test_consume_aligned_prefix() {
        let mut buf = AlignedBuffer::new(2048, 512);
        let data: Vec<u8> = (0..1300u32).map(|i| i as u8).collect();
        buf.push(&data);

        assert_eq!(buf.aligned_len(), 1024);
        buf.consume(1024);
        assert_eq!(buf.as_slice(), &data[1024..]);
        assert!(buf.is_aligned());
    }

    #[test]
    fn test_padded_zero_fills_stale_bytes() {
        let mut buf = AlignedBuffer::new(1024, 512);
        buf.push(&[7u8; 700]);
        buf.consume(512);

        let padded = buf.padded();
        assert_eq!(padded.len(), 512);
        assert!(padded[..188].iter().all(|&b| b == 7));
        assert!(padded[188..].iter().all(|&b| b == 0));
        assert_eq!(buf.len(), 188);
    }

    #[test]
    fn test_seal_shares_bytes() {
        let mut buf = AlignedBuffer::new(4096, 4096);
        buf.push(b"table bytes");
        let sealed = buf.seal();

        let local = sealed.share();
        let shipped = sealed.share();
        assert_eq!(local, shipped);
        assert_eq!(local.as_ptr(), shipped.as_ptr());
        assert_eq!(sealed.len(), 11);
        assert_eq!(sealed.alignment(), 4096);
    }
}
