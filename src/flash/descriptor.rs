//! Flash task descriptors as stored in the task queue
//!
//! Layout, all fields little endian:
//!
//! ```text
//! 0   command     u8
//! 1   transaction u8    0 outside of a transaction
//! 2   slot        u16   index into the callback table, 0xFFFF for none
//! 4   user_tag    u32
//! 8   aux         u32
//! 12  command parameters
//! ```
//!
//! Erase parameters are `start u16, num u16, remaining u16, reserved u16`.
//! Writes carry `address u32, len u32`, cached writes add `crc32 u32` and the
//! payload padded with `0xFF` to whole words. Cached data is `len u32` and
//! the padded payload. The end of a transaction has no parameters.

use crate::flash::{TaskKind, WORD_SIZE};
use crate::memory::padded_len;

/// Slot value of a task without callback or shared source
pub(crate) const NO_SLOT: u16 = u16::MAX;

/// Transaction id of a task queued outside of a transaction
pub(crate) const NO_TRANSACTION: u8 = 0;

const HEADER_SIZE: usize = 12;
const ERASE_SIZE: usize = HEADER_SIZE + 8;
const WRITE_REF_SIZE: usize = HEADER_SIZE + 8;
/// Offset of the payload of a cached write
pub(crate) const CACHED_DATA_OFFSET: usize = HEADER_SIZE + 12;
/// Offset of the payload of a cache-only task
const CACHE_ONLY_OFFSET: usize = HEADER_SIZE + 4;
const REMAINING_OFFSET: usize = HEADER_SIZE + 4;

const CMD_ERASE_PAGES: u8 = 1;
const CMD_WRITE_REF: u8 = 2;
const CMD_WRITE_CACHED: u8 = 3;
const CMD_CACHE_DATA: u8 = 4;
const CMD_END_TRANSACTION: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    ErasePages {
        start_page: u16,
        num_pages: u16,
        remaining: u16,
    },
    WriteRef { address: u32, len: u32 },
    WriteCached { address: u32, len: u32, crc: u32 },
    CacheData { len: u32 },
    EndTransaction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TaskDescriptor {
    pub command: Command,
    pub transaction: u8,
    pub slot: u16,
    pub user_tag: u32,
    pub aux: u32,
}

fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

impl TaskDescriptor {
    /// Record length for this descriptor
    pub fn encoded_len(&self) -> usize {
        match self.command {
            Command::ErasePages { .. } => ERASE_SIZE,
            Command::WriteRef { .. } => WRITE_REF_SIZE,
            Command::WriteCached { len, .. } => CACHED_DATA_OFFSET + padded_len(len as usize),
            Command::CacheData { len } => CACHE_ONLY_OFFSET + padded_len(len as usize),
            Command::EndTransaction => HEADER_SIZE,
        }
    }

    /// Where the payload starts, for commands that carry one
    pub fn payload_offset(&self) -> Option<usize> {
        match self.command {
            Command::WriteCached { .. } => Some(CACHED_DATA_OFFSET),
            Command::CacheData { .. } => Some(CACHE_ONLY_OFFSET),
            _ => None,
        }
    }

    /// Serialize into `out`, which is exactly [`Self::encoded_len`] bytes
    ///
    /// The payload of a cached write or cached data is not written here; the
    /// padding after it is filled with `0xFF`.
    pub fn encode(&self, out: &mut [u8]) {
        out[1] = self.transaction;
        out[2..4].copy_from_slice(&self.slot.to_le_bytes());
        out[4..8].copy_from_slice(&self.user_tag.to_le_bytes());
        out[8..12].copy_from_slice(&self.aux.to_le_bytes());

        match self.command {
            Command::ErasePages {
                start_page,
                num_pages,
                remaining,
            } => {
                out[0] = CMD_ERASE_PAGES;
                out[12..14].copy_from_slice(&start_page.to_le_bytes());
                out[14..16].copy_from_slice(&num_pages.to_le_bytes());
                out[16..18].copy_from_slice(&remaining.to_le_bytes());
                out[18..20].fill(0);
            }
            Command::WriteRef { address, len } => {
                out[0] = CMD_WRITE_REF;
                out[12..16].copy_from_slice(&address.to_le_bytes());
                out[16..20].copy_from_slice(&len.to_le_bytes());
            }
            Command::WriteCached { address, len, crc } => {
                out[0] = CMD_WRITE_CACHED;
                out[12..16].copy_from_slice(&address.to_le_bytes());
                out[16..20].copy_from_slice(&len.to_le_bytes());
                out[20..24].copy_from_slice(&crc.to_le_bytes());
                out[CACHED_DATA_OFFSET + len as usize..].fill(0xFF);
            }
            Command::CacheData { len } => {
                out[0] = CMD_CACHE_DATA;
                out[12..16].copy_from_slice(&len.to_le_bytes());
                out[CACHE_ONLY_OFFSET + len as usize..].fill(0xFF);
            }
            Command::EndTransaction => out[0] = CMD_END_TRANSACTION,
        }
    }

    /// Parse a stored descriptor, `None` if the record is malformed
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }

        let command = match bytes[0] {
            CMD_ERASE_PAGES if bytes.len() >= ERASE_SIZE => Command::ErasePages {
                start_page: le_u16(bytes, 12),
                num_pages: le_u16(bytes, 14),
                remaining: le_u16(bytes, REMAINING_OFFSET),
            },
            CMD_WRITE_REF if bytes.len() >= WRITE_REF_SIZE => Command::WriteRef {
                address: le_u32(bytes, 12),
                len: le_u32(bytes, 16),
            },
            CMD_WRITE_CACHED if bytes.len() >= CACHED_DATA_OFFSET => {
                let len = le_u32(bytes, 16);
                if bytes.len() < CACHED_DATA_OFFSET + padded_len(len as usize) {
                    return None;
                }
                Command::WriteCached {
                    address: le_u32(bytes, 12),
                    len,
                    crc: le_u32(bytes, 20),
                }
            }
            CMD_CACHE_DATA if bytes.len() >= CACHE_ONLY_OFFSET => {
                let len = le_u32(bytes, 12);
                if bytes.len() < CACHE_ONLY_OFFSET + padded_len(len as usize) {
                    return None;
                }
                Command::CacheData { len }
            }
            CMD_END_TRANSACTION => Command::EndTransaction,
            _ => return None,
        };

        Some(Self {
            command,
            transaction: bytes[1],
            slot: le_u16(bytes, 2),
            user_tag: le_u32(bytes, 4),
            aux: le_u32(bytes, 8),
        })
    }

    /// Slot of a stored record, readable even when the rest is malformed
    pub fn slot_of(bytes: &[u8]) -> Option<u16> {
        (bytes.len() >= HEADER_SIZE).then(|| le_u16(bytes, 2))
    }

    /// Store a new remaining page count into an encoded erase descriptor
    pub fn set_remaining(bytes: &mut [u8], remaining: u16) {
        bytes[REMAINING_OFFSET..REMAINING_OFFSET + 2].copy_from_slice(&remaining.to_le_bytes());
    }

    /// Word-padded payload of an encoded cached write
    pub fn cached_payload(bytes: &[u8], len: u32) -> &[u8] {
        let padded = padded_len(len as usize);
        debug_assert_eq!(padded % WORD_SIZE, 0);
        &bytes[CACHED_DATA_OFFSET..CACHED_DATA_OFFSET + padded]
    }

    /// Payload of `bytes` without padding, empty for commands without one
    pub fn payload<'a>(&self, bytes: &'a [u8]) -> &'a [u8] {
        let len = match self.command {
            Command::WriteCached { len, .. } | Command::CacheData { len } => len as usize,
            _ => 0,
        };
        match self.payload_offset() {
            Some(offset) => &bytes[offset..offset + len],
            None => &[],
        }
    }

    /// Public description of the task
    pub fn kind(&self) -> TaskKind {
        match self.command {
            Command::ErasePages {
                start_page,
                num_pages,
                ..
            } => TaskKind::ErasePages {
                start_page,
                num_pages,
            },
            Command::WriteRef { address, len } => TaskKind::Write {
                address,
                len,
                cached: false,
            },
            Command::WriteCached { address, len, .. } => TaskKind::Write {
                address,
                len,
                cached: true,
            },
            Command::CacheData { len } => TaskKind::CacheData { len },
            Command::EndTransaction => TaskKind::EndTransaction,
        }
    }
}
