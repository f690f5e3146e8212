//! Circular queue of variable-length byte records
//!
//! This module implements a fixed-capacity FIFO of length-prefixed records
//! over a single byte buffer. Key features include:
//!
//! - Reserve-then-write pattern: [`CircularRecordQueue::reserve`] hands out a
//!   mutable slice inside the buffer so producers fill records in place
//! - Word-aligned records, so payloads can go to flash without copying
//! - Wrap-around signalled by a zero length field behind which the writer
//!   restarted at the buffer start
//! - Removal from both ends; the tail side walks the queue since no tail
//!   length is cached
//!
//! The queue is single-threaded. A slice returned by `reserve` or a peek
//! borrows the queue, so it can not outlive the next mutating call.

use crate::error::{QueueError, Result};
use crate::memory::cursor::Cursor;
use crate::memory::{
    has_slack, is_wrap_marker, next_record, read_len, record_stride, usable_end, RecordHeader,
};
use log::{debug, error};
use std::fmt;
use std::fmt::Write as _;

/// Fixed-capacity circular buffer holding variable-length byte records
pub struct CircularRecordQueue<B = Box<[u8]>> {
    /// Backing storage, never resized
    buffer: B,
    /// End of the usable region
    end: usize,
    /// Offset of the oldest record
    read: usize,
    /// Offset where the next record is placed
    write: usize,
    /// Number of live records
    count: usize,
    /// Sum of the strides of all live records
    used: usize,
}

impl CircularRecordQueue<Box<[u8]>> {
    /// Create a queue that owns a zeroed buffer of `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Self::new(vec![0u8; capacity].into_boxed_slice())
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> CircularRecordQueue<B> {
    /// Create an empty queue over an externally supplied buffer
    ///
    /// The buffer must be larger than [`RecordHeader::MIN_QUEUE_SIZE`]; one
    /// byte of it is never used.
    pub fn new(buffer: B) -> Result<Self> {
        let len = buffer.as_ref().len();
        if len <= RecordHeader::MIN_QUEUE_SIZE {
            error!(target: "queue", "record queue buffer of {} bytes is too small", len);
            return Err(QueueError::InvalidConfig("record queue buffer too small"));
        }

        let mut queue = Self {
            buffer,
            end: usable_end(len),
            read: 0,
            write: 0,
            count: 0,
            used: 0,
        };
        queue.seal();
        Ok(queue)
    }

    fn bytes(&self) -> &[u8] {
        &self.buffer.as_ref()[..self.end]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let end = self.end;
        &mut self.buffer.as_mut()[..end]
    }

    /// Write the zero length end marker at the write offset
    fn seal(&mut self) {
        let write = self.write;
        if write < self.end {
            self.bytes_mut()[write..write + 2].fill(0);
        }
    }

    fn reset_offsets(&mut self) {
        self.read = 0;
        self.write = 0;
        self.used = 0;
        self.seal();
    }

    /// Where a record of `stride` bytes would go, if anywhere
    fn placement(&self, stride: usize) -> Option<usize> {
        if self.write >= self.read {
            if self.write + stride <= self.end {
                Some(self.write)
            } else if has_slack(0, stride, self.read) {
                // The old write offset already carries the wrap marker
                Some(0)
            } else {
                None
            }
        } else if has_slack(self.write, stride, self.read) {
            Some(self.write)
        } else {
            None
        }
    }

    /// Reserve room for a record of `len` bytes and return it for writing
    ///
    /// The record is live as soon as this returns. Fails with
    /// [`QueueError::Full`] when there is no room right now, without touching
    /// the queue, and with [`QueueError::RecordTooLarge`] when the record could
    /// not fit even into an empty queue.
    pub fn reserve(&mut self, len: usize) -> Result<&mut [u8]> {
        if len == 0 {
            return Err(QueueError::EmptyRecord);
        }

        let stride = record_stride(len);
        if len > u16::MAX as usize || stride > self.end {
            error!(
                target: "queue",
                "record of {} bytes can never fit a queue of {} bytes", len, self.end
            );
            return Err(QueueError::RecordTooLarge {
                len,
                capacity: self.end,
            });
        }

        let pos = self.placement(stride).ok_or(QueueError::Full { needed: stride })?;

        let start = pos + RecordHeader::SIZE;
        let bytes = self.bytes_mut();
        RecordHeader::new(len as u16).encode(&mut bytes[pos..start]);
        bytes[start..pos + stride].fill(0);

        self.write = pos + stride;
        self.count += 1;
        self.used += stride;
        self.seal();

        Ok(&mut self.bytes_mut()[start..start + len])
    }

    /// Append a copy of `data`
    pub fn put(&mut self, data: &[u8]) -> Result<()> {
        self.reserve(data.len())?.copy_from_slice(data);
        Ok(())
    }

    fn position_of(&self, index: usize) -> Option<usize> {
        if index >= self.count {
            return None;
        }
        let mut pos = self.read;
        for _ in 0..index {
            pos = next_record(self.bytes(), pos, self.write);
        }
        Some(pos)
    }

    fn payload_range(&self, pos: usize) -> std::ops::Range<usize> {
        let start = pos + RecordHeader::SIZE;
        start..start + read_len(self.bytes(), pos)
    }

    /// The record at logical position `index`, 0 being the oldest
    pub fn peek_next(&self, index: usize) -> Option<&[u8]> {
        let range = self.payload_range(self.position_of(index)?);
        Some(&self.bytes()[range])
    }

    /// Mutable access to the record at logical position `index`
    pub fn peek_next_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        let range = self.payload_range(self.position_of(index)?);
        Some(&mut self.bytes_mut()[range])
    }

    /// Remove the oldest record
    pub fn discard_next(&mut self) {
        if self.count == 0 {
            return;
        }

        let stride = record_stride(read_len(self.bytes(), self.read));
        self.count -= 1;
        if self.count == 0 {
            self.reset_offsets();
            return;
        }

        self.used -= stride;
        let next = self.read + stride;
        self.read = if is_wrap_marker(self.bytes(), next, self.write) {
            0
        } else {
            next
        };
    }

    /// The newest record
    pub fn peek_last(&self) -> Option<&[u8]> {
        self.count.checked_sub(1).and_then(|index| self.peek_next(index))
    }

    /// Remove the newest record
    pub fn discard_last(&mut self) {
        match self.count {
            0 => return,
            1 => {
                self.count = 0;
                self.reset_offsets();
                return;
            }
            _ => {}
        }

        let mut prev = self.read;
        for _ in 0..self.count - 2 {
            prev = next_record(self.bytes(), prev, self.write);
        }
        let last = next_record(self.bytes(), prev, self.write);

        self.count -= 1;
        self.used -= record_stride(read_len(self.bytes(), last));
        self.write = if last == 0 {
            // The removed record was the only one behind the wrap, so the
            // writer continues in the tail region again
            prev + record_stride(read_len(self.bytes(), prev))
        } else {
            last
        };
        self.seal();
    }

    /// Drop every record
    pub fn clean(&mut self) {
        self.count = 0;
        self.reset_offsets();
    }

    /// Number of live records
    pub fn amount_of_packets(&self) -> usize {
        self.count
    }

    /// Whether the queue holds no record
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Usable bytes of the backing buffer
    pub fn capacity(&self) -> usize {
        self.end
    }

    /// Bytes taken by live records including headers and padding
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    /// Current usage as a percentage of the capacity
    pub fn usage_percent(&self) -> f32 {
        (self.used as f32 / self.end as f32) * 100.0
    }

    /// Current read and write offsets
    pub fn offsets(&self) -> (usize, usize) {
        (self.read, self.write)
    }

    /// Iterate the live records, oldest first
    pub fn iter(&self) -> Cursor<'_> {
        Cursor::new(self.bytes(), self.read, self.write, self.count)
    }

    /// Render the live records for debugging and log them
    pub fn dump(&self) -> String {
        let mut out = format!(
            "records: {}, read: {}, write: {}, used: {}/{}\n",
            self.count, self.read, self.write, self.used, self.end
        );
        for (i, record) in self.iter().enumerate() {
            let _ = write!(out, "#{:03} @{:04} len {:3}:", i, record.offset, record.data.len());
            for byte in record.data {
                let _ = write!(out, " {:02X}", byte);
            }
            out.push('\n');
        }
        debug!(target: "queue", "{}", out);
        out
    }
}

impl<B> fmt::Debug for CircularRecordQueue<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircularRecordQueue")
            .field("capacity", &self.end)
            .field("read", &self.read)
            .field("write", &self.write)
            .field("count", &self.count)
            .field("used", &self.used)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_basic_put_peek_discard() {
        let mut queue = CircularRecordQueue::with_capacity(256).unwrap();

        queue.put(b"test message").unwrap();
        assert_eq!(queue.amount_of_packets(), 1);
        assert_eq!(queue.peek_next(0), Some(&b"test message"[..]));

        queue.discard_next();
        assert!(queue.is_empty());
        assert_eq!(queue.peek_next(0), None);
        assert_eq!(queue.offsets(), (0, 0));
    }

    #[test]
    fn test_reserve_write_in_place() {
        let mut queue = CircularRecordQueue::with_capacity(256).unwrap();

        let slot = queue.reserve(9).unwrap();
        slot.copy_from_slice(b"test data");

        assert_eq!(queue.peek_next(0).unwrap(), b"test data");
        // 4 byte header plus 9 bytes padded to 12
        assert_eq!(queue.used_bytes(), 16);
    }

    #[test]
    fn test_reserve_rejects_zero_and_oversized() {
        let mut queue = CircularRecordQueue::with_capacity(64).unwrap();

        assert_eq!(queue.reserve(0).unwrap_err(), QueueError::EmptyRecord);

        let err = queue.reserve(100).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Defect);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_buffer_too_small() {
        assert!(CircularRecordQueue::new([0u8; 8]).is_err());
        assert!(CircularRecordQueue::new([0u8; 9]).is_ok());
    }

    #[test]
    fn test_external_buffer() {
        let mut storage = [0u8; 64];
        {
            let mut queue = CircularRecordQueue::new(&mut storage[..]).unwrap();
            queue.put(&[7, 7, 7]).unwrap();
            assert_eq!(queue.peek_last().unwrap(), &[7, 7, 7]);
        }
        assert_eq!(&storage[..7], &[3, 0, 0, 0, 7, 7, 7]);
    }

    #[test]
    fn test_full_queue_is_untouched() {
        // 60 usable bytes: 5 records of 12 bytes
        let mut queue = CircularRecordQueue::with_capacity(64).unwrap();
        for i in 0..5u8 {
            queue.put(&[i; 8]).unwrap();
        }

        let before = (queue.offsets(), queue.amount_of_packets(), queue.used_bytes());
        let err = queue.put(&[9; 8]).unwrap_err();
        assert_eq!(err, QueueError::Full { needed: 12 });
        assert_eq!(err.kind(), ErrorKind::Recoverable);
        assert_eq!(before, (queue.offsets(), queue.amount_of_packets(), queue.used_bytes()));
    }

    #[test]
    fn test_wrap_keeps_slack() {
        let mut queue = CircularRecordQueue::with_capacity(64).unwrap();
        for i in 0..5u8 {
            queue.put(&[i; 8]).unwrap();
        }
        // Free exactly one record at the front
        queue.discard_next();
        assert_eq!(queue.offsets(), (12, 60));

        // 12 bytes at the start would touch the reader, which is not allowed
        assert!(queue.put(&[5; 8]).is_err());

        queue.discard_next();
        queue.put(&[5; 8]).unwrap();
        assert_eq!(queue.offsets(), (24, 12));
        assert!(queue.used_bytes() <= queue.capacity() - 1);
    }

    #[test]
    fn test_wrap_and_drain_returns_to_start() {
        let mut queue = CircularRecordQueue::with_capacity(100).unwrap();
        let mut expected = std::collections::VecDeque::new();
        let mut counter = 0u8;

        for round in 0..50 {
            while queue.put(&[counter; 13]).is_ok() {
                expected.push_back(counter);
                counter = counter.wrapping_add(1);
            }
            for _ in 0..(round % 4 + 1).min(expected.len()) {
                let value = expected.pop_front().unwrap();
                assert_eq!(queue.peek_next(0).unwrap(), &[value; 13]);
                queue.discard_next();
            }
        }

        while let Some(value) = expected.pop_front() {
            assert_eq!(queue.peek_next(0).unwrap(), &[value; 13]);
            queue.discard_next();
        }
        assert_eq!(queue.offsets(), (0, 0));
        assert_eq!(queue.used_bytes(), 0);
    }

    #[test]
    fn test_peek_by_index() {
        let mut queue = CircularRecordQueue::with_capacity(600).unwrap();
        for i in 0..10u8 {
            let slot = queue.reserve(20).unwrap();
            slot[0] = i;
        }

        for i in 0..10u8 {
            assert_eq!(queue.peek_next(i as usize).unwrap()[0], i);
        }
        assert_eq!(queue.peek_next(10), None);
    }

    #[test]
    fn test_peek_and_discard_last() {
        let mut queue = CircularRecordQueue::with_capacity(200).unwrap();

        queue.put(&[1; 7]).unwrap();
        assert_eq!(queue.peek_next(0), queue.peek_last());

        queue.put(&[2; 8]).unwrap();
        assert_eq!(queue.peek_last().unwrap(), &[2; 8]);
        assert_eq!(queue.peek_next(0).unwrap(), &[1; 7]);

        queue.put(&[3; 5]).unwrap();
        assert_eq!(queue.peek_last().unwrap(), &[3; 5]);

        queue.discard_last();
        assert_eq!(queue.peek_last().unwrap(), &[2; 8]);
        queue.discard_last();
        queue.discard_last();
        assert!(queue.is_empty());
        assert_eq!(queue.offsets(), (0, 0));
    }

    #[test]
    fn test_discard_last_unwraps_writer() {
        let mut queue = CircularRecordQueue::with_capacity(64).unwrap();
        for i in 0..4u8 {
            queue.put(&[i; 8]).unwrap();
        }
        queue.discard_next();
        queue.discard_next();
        // Tail has room for one more, then the next one wraps
        queue.put(&[4; 8]).unwrap();
        queue.put(&[5; 8]).unwrap();
        assert_eq!(queue.offsets(), (24, 12));

        queue.discard_last();
        assert_eq!(queue.offsets(), (24, 60));
        assert_eq!(queue.peek_last().unwrap(), &[4; 8]);

        // The freed front is reusable
        queue.put(&[6; 8]).unwrap();
        let values: Vec<_> = queue.iter().map(|record| record.data[0]).collect();
        assert_eq!(values, vec![2, 3, 4, 6]);
    }

    #[test]
    fn test_peek_next_mut() {
        let mut queue = CircularRecordQueue::with_capacity(64).unwrap();
        queue.put(&[1, 2, 3, 4]).unwrap();
        queue.peek_next_mut(0).unwrap()[3] = 9;
        assert_eq!(queue.peek_next(0).unwrap(), &[1, 2, 3, 9]);
    }

    #[test]
    fn test_clean() {
        let mut queue = CircularRecordQueue::with_capacity(64).unwrap();
        queue.put(b"abc").unwrap();
        queue.put(b"def").unwrap();
        queue.clean();
        assert!(queue.is_empty());
        assert_eq!(queue.offsets(), (0, 0));
        assert_eq!(queue.usage_percent(), 0.0);
    }

    #[test]
    fn test_dump() {
        let mut queue = CircularRecordQueue::with_capacity(64).unwrap();
        queue.put(&[0xAB, 0x01]).unwrap();
        let dump = queue.dump();
        assert!(dump.contains("records: 1"));
        assert!(dump.contains("AB 01"));
    }
}
