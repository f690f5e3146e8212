//! Outbound message scheduling for one radio link
//!
//! Messages wait in one [`SendQueue`] per [`Priority`] level. Every record
//! starts with a small frame prefix so the link layer knows whether it is a
//! whole message or one chunk of a fragmented one:
//!
//! ```text
//! +-------+-------------+-----------------+---------+
//! | flags | chunk index | handle (u16 LE) | payload |
//! +-------+-------------+-----------------+---------+
//! ```
//!
//! [`PriorityFragmentingQueue`] decides which level sends next.

pub mod priority;
pub mod send_queue;

pub use priority::PriorityFragmentingQueue;
pub use send_queue::SendQueue;

use std::fmt;

/// Delivery priority, lower values are more urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub u8);

impl Priority {
    /// Mesh-relevant traffic that must never wait behind a fragment
    pub const VITAL: Priority = Priority(0);
    /// High priority
    pub const HIGH: Priority = Priority(1);
    /// Medium priority
    pub const MEDIUM: Priority = Priority(2);
    /// Low priority
    pub const LOW: Priority = Priority(3);

    /// Index of the level in the queue array
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Whether this is the non-fragmenting top level
    pub fn is_vital(self) -> bool {
        self == Self::VITAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::VITAL => f.write_str("VITAL"),
            Self::HIGH => f.write_str("HIGH"),
            Self::MEDIUM => f.write_str("MEDIUM"),
            Self::LOW => f.write_str("LOW"),
            Priority(level) => write!(f, "LEVEL{}", level),
        }
    }
}

/// Identifies one queued message, shared by all of its chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHandle(pub u16);

/// How a record relates to the message it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkTag {
    /// The record is the complete message
    Whole,
    /// One piece of a fragmented message
    Chunk {
        /// Position of this chunk in the message, starting at 0
        index: u8,
        /// Whether this is the final chunk
        last: bool,
    },
}

impl ChunkTag {
    const FLAG_CHUNK: u8 = 0x01;
    const FLAG_MORE_FOLLOWS: u8 = 0x02;

    /// Whether more chunks of the same message come after this record
    pub fn more_follows(self) -> bool {
        matches!(self, ChunkTag::Chunk { last: false, .. })
    }

    /// Whether this chunk continues a message whose start was already sent
    pub fn is_continuation(self) -> bool {
        matches!(self, ChunkTag::Chunk { index, .. } if index > 0)
    }

    fn flags(self) -> u8 {
        match self {
            ChunkTag::Whole => 0,
            ChunkTag::Chunk { last: true, .. } => Self::FLAG_CHUNK,
            ChunkTag::Chunk { last: false, .. } => Self::FLAG_CHUNK | Self::FLAG_MORE_FOLLOWS,
        }
    }

    fn from_bytes(flags: u8, index: u8) -> Self {
        if flags & Self::FLAG_CHUNK == 0 {
            ChunkTag::Whole
        } else {
            ChunkTag::Chunk {
                index,
                last: flags & Self::FLAG_MORE_FOLLOWS == 0,
            }
        }
    }
}

/// A queued record as seen by the link layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Whole message or chunk
    pub tag: ChunkTag,
    /// Message the record belongs to
    pub handle: MessageHandle,
    /// Bytes to put on the air
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Size of the prefix stored in front of every payload
    pub const PREFIX_SIZE: usize = 4;

    pub(crate) fn encode_prefix(tag: ChunkTag, handle: MessageHandle, out: &mut [u8]) {
        out[0] = tag.flags();
        out[1] = match tag {
            ChunkTag::Chunk { index, .. } => index,
            ChunkTag::Whole => 0,
        };
        out[2..Self::PREFIX_SIZE].copy_from_slice(&handle.0.to_le_bytes());
    }

    pub(crate) fn decode(record: &'a [u8]) -> Self {
        Self {
            tag: ChunkTag::from_bytes(record[0], record[1]),
            handle: MessageHandle(u16::from_le_bytes([record[2], record[3]])),
            payload: &record[Self::PREFIX_SIZE..],
        }
    }
}
