//! Non-consuming traversal of a circular record queue
//!
//! A cursor starts at the oldest record and follows the wrap markers exactly
//! like the reader does, without moving the queue's read offset. It borrows
//! the queue immutably, so no record can be added or removed while a cursor
//! is alive.

use crate::memory::{next_record, read_len, RecordHeader};

/// A record seen by a [`Cursor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRef<'a> {
    /// Offset of the record header in the backing buffer
    pub offset: usize,
    /// Record payload
    pub data: &'a [u8],
}

/// Iterator over the records of a queue, oldest first
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    bytes: &'a [u8],
    write: usize,
    position: usize,
    remaining: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(bytes: &'a [u8], read: usize, write: usize, count: usize) -> Self {
        Self {
            bytes,
            write,
            position: read,
            remaining: count,
        }
    }

    /// Offset of the record the next call to `next` returns
    pub fn position(&self) -> usize {
        self.position
    }

    /// Whether every record has been visited
    pub fn at_end(&self) -> bool {
        self.remaining == 0
    }

    /// Skip `n` records without returning them
    pub fn skip_records(&mut self, n: usize) -> &mut Self {
        for _ in 0..n.min(self.remaining) {
            self.advance();
        }
        self
    }

    fn advance(&mut self) {
        self.remaining -= 1;
        if self.remaining > 0 {
            self.position = next_record(self.bytes, self.position, self.write);
        }
    }
}

impl<'a> Iterator for Cursor<'a> {
    type Item = RecordRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.at_end() {
            return None;
        }

        let offset = self.position;
        let start = offset + RecordHeader::SIZE;
        let data = &self.bytes[start..start + read_len(self.bytes, offset)];
        self.advance();

        Some(RecordRef { offset, data })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Cursor<'_> {}
