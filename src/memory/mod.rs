//! In-memory circular record storage
//!
//! This module holds the byte layout shared by every queue in the crate:
//!
//! - A 4-byte record header carrying a 16-bit payload length
//! - Payload padding so every record starts on a word boundary
//! - The wrap marker (a zero length field) and the one byte of slack that
//!   keeps a full queue distinguishable from an empty one
//!
//! The layout helpers are free functions over a byte slice so that both
//! [`circular::CircularRecordQueue`] and [`cursor::Cursor`] walk records the
//! same way.

pub mod circular;
pub mod cursor;

/// Header stored in front of every record
///
/// Layout: `len: u16` little endian followed by two reserved zero bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Payload length in bytes, 0 marks "wrap to buffer start"
    pub len: u16,
}

impl RecordHeader {
    /// Size of the record header in bytes
    pub const SIZE: usize = 4;

    /// Every record stride is a multiple of this
    pub const ALIGN: usize = 4;

    /// Bytes kept free between the writer and the reader
    pub const SLACK: usize = 1;

    /// Smallest buffer that can hold a one byte record
    pub const MIN_QUEUE_SIZE: usize = Self::SIZE + Self::ALIGN - 1 + Self::SLACK;

    /// Create a new record header
    pub fn new(len: u16) -> Self {
        Self { len }
    }

    /// Serialize the header into the first [`Self::SIZE`] bytes of `out`
    pub fn encode(&self, out: &mut [u8]) {
        out[..2].copy_from_slice(&self.len.to_le_bytes());
        out[2..Self::SIZE].fill(0);
    }

    /// Read a header from the start of `bytes`
    pub fn decode(bytes: &[u8]) -> Self {
        Self {
            len: u16::from_le_bytes([bytes[0], bytes[1]]),
        }
    }

    /// Total bytes this record occupies in the buffer
    pub fn stride(&self) -> usize {
        record_stride(self.len as usize)
    }
}

/// Round `len` up to the next multiple of [`RecordHeader::ALIGN`]
pub fn padded_len(len: usize) -> usize {
    (len + RecordHeader::ALIGN - 1) & !(RecordHeader::ALIGN - 1)
}

/// Bytes a record with a payload of `len` bytes occupies
pub fn record_stride(len: usize) -> usize {
    RecordHeader::SIZE + padded_len(len)
}

/// End of the usable region of a buffer of `buffer_len` bytes
///
/// One byte is reserved and the rest rounded down to the record alignment.
pub fn usable_end(buffer_len: usize) -> usize {
    buffer_len.saturating_sub(RecordHeader::SLACK) & !(RecordHeader::ALIGN - 1)
}

/// Payload length of the record at `pos`
pub fn read_len(bytes: &[u8], pos: usize) -> usize {
    RecordHeader::decode(&bytes[pos..]).len as usize
}

/// Whether a record of `stride` bytes placed at `start` leaves at least
/// [`RecordHeader::SLACK`] bytes before the reader at `read`
pub fn has_slack(start: usize, stride: usize, read: usize) -> bool {
    start + stride + RecordHeader::SLACK <= read
}

/// Whether the scan position `pos` sits on the wrap marker
///
/// The writer has wrapped when it is behind `pos`. In that state the end of
/// the tail region is either a zero length field or too close to the buffer
/// end to hold a header at all.
pub fn is_wrap_marker(bytes: &[u8], pos: usize, write: usize) -> bool {
    write < pos && (pos + RecordHeader::SIZE > bytes.len() || read_len(bytes, pos) == 0)
}

/// Position of the record following the one at `pos`
pub fn next_record(bytes: &[u8], pos: usize, write: usize) -> usize {
    let next = pos + record_stride(read_len(bytes, pos));
    if is_wrap_marker(bytes, next, write) {
        0
    } else {
        next
    }
}
