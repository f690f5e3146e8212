//! Multi-level send queue with fragmentation and anti-starvation
//!
//! Selection rules, in order:
//!
//! 1. A level in the middle of a fragmented message keeps the link until its
//!    last chunk went out, so chunks of different messages never interleave.
//! 2. VITAL wins whenever it has something to send.
//! 3. Otherwise the most urgent non-empty level wins, unless this would be its
//!    `starvation_threshold`-th win in a row. In that case its counter is
//!    reset and it is skipped once, letting a lower level through.

use crate::config::PriorityQueueConfig;
use crate::error::{QueueError, Result};
use crate::link::send_queue::SendQueue;
use crate::link::{ChunkTag, MessageHandle, Priority};
use log::{debug, error, trace};

/// One outbound queue per priority level of a link
#[derive(Debug)]
pub struct PriorityFragmentingQueue {
    queues: Vec<SendQueue>,
    /// Consecutive wins per level, unused for VITAL
    droplets: Vec<u8>,
    starvation_threshold: u8,
    max_vital_size: usize,
    next_handle: u16,
}

impl PriorityFragmentingQueue {
    /// Create a queue with one level per entry of `config.level_sizes`
    pub fn new(config: &PriorityQueueConfig) -> Result<Self> {
        config.validate()?;

        let queues = config
            .level_sizes
            .iter()
            .enumerate()
            .map(|(level, &size)| SendQueue::new(Priority(level as u8), size))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            droplets: vec![0; queues.len()],
            queues,
            starvation_threshold: config.starvation_threshold,
            max_vital_size: config.max_vital_size,
            next_handle: 1,
        })
    }

    /// Number of priority levels
    pub fn levels(&self) -> usize {
        self.queues.len()
    }

    fn level_index(&self, priority: Priority) -> Result<usize> {
        if priority.index() >= self.queues.len() {
            error!(target: "link", "priority {} out of range", priority.0);
            return Err(QueueError::InvalidPriority {
                priority: priority.0,
                levels: self.queues.len(),
            });
        }
        Ok(priority.index())
    }

    fn allocate_handle(&mut self) -> MessageHandle {
        let handle = MessageHandle(self.next_handle);
        self.next_handle = self.next_handle.checked_add(1).unwrap_or(1);
        handle
    }

    /// Queue `data` at `priority`, fragmenting it into chunks of at most
    /// `max_chunk_payload` bytes
    ///
    /// Either every chunk is queued or none is. VITAL messages are never
    /// fragmented: one that exceeds the configured ceiling is logged and
    /// queued one level down instead.
    pub fn split_and_add_message(
        &mut self,
        priority: Priority,
        data: &[u8],
        max_chunk_payload: usize,
    ) -> Result<MessageHandle> {
        let mut level = self.level_index(priority)?;
        if data.is_empty() {
            return Err(QueueError::EmptyRecord);
        }
        if max_chunk_payload == 0 {
            error!(target: "link", "chunk payload size of 0");
            return Err(QueueError::InvalidChunkSize);
        }

        if level == 0 {
            if data.len() <= self.max_vital_size {
                let handle = self.allocate_handle();
                self.queues[0].push(ChunkTag::Whole, handle, data)?;
                return Ok(handle);
            }
            error!(
                target: "link",
                "VITAL message of {} bytes exceeds {} bytes, queueing it as {}",
                data.len(),
                self.max_vital_size,
                Priority(1)
            );
            level = 1;
        }

        if data.len() <= max_chunk_payload {
            let handle = self.allocate_handle();
            self.queues[level].push(ChunkTag::Whole, handle, data)?;
            return Ok(handle);
        }

        let chunk_count = data.len().div_ceil(max_chunk_payload);
        if chunk_count > u8::MAX as usize + 1 {
            error!(
                target: "link",
                "{} bytes in chunks of {} need {} chunks",
                data.len(),
                max_chunk_payload,
                chunk_count
            );
            return Err(QueueError::InvalidChunkSize);
        }

        let handle = self.allocate_handle();
        let queue = &mut self.queues[level];
        for (index, chunk) in data.chunks(max_chunk_payload).enumerate() {
            let tag = ChunkTag::Chunk {
                index: index as u8,
                last: index + 1 == chunk_count,
            };
            if let Err(err) = queue.push(tag, handle, chunk) {
                for _ in 0..index {
                    queue.undo_push();
                }
                debug!(
                    target: "link",
                    "{} chunk {}/{} rejected: {}",
                    queue.priority(),
                    index,
                    chunk_count,
                    err
                );
                return Err(err);
            }
        }

        trace!(
            target: "link",
            "queued {} bytes as {} chunks at {}",
            data.len(),
            chunk_count,
            queue.priority()
        );
        Ok(handle)
    }

    fn split_level(&self) -> Option<usize> {
        let mut splitting = self
            .queues
            .iter()
            .enumerate()
            .filter(|(_, queue)| queue.is_currently_sending_split_message())
            .map(|(level, _)| level);

        let first = splitting.next();
        if let Some(other) = splitting.next() {
            error!(target: "link", "levels {:?} and {} are both mid-split", first, other);
        }
        first
    }

    fn select_level(&mut self) -> Option<usize> {
        if let Some(level) = self.split_level() {
            return Some(level);
        }
        if self.queues[0].has_more_to_look_ahead() {
            return Some(0);
        }

        // Two passes, a level skipped for starvation in the first may still
        // win in the second if nothing below it has data.
        for _ in 0..2 {
            for level in 1..self.queues.len() {
                if !self.queues[level].has_more_to_look_ahead() {
                    continue;
                }
                self.droplets[level] = self.droplets[level].saturating_add(1);
                if self.droplets[level] >= self.starvation_threshold {
                    trace!(
                        target: "link",
                        "{} yields after {} selections",
                        Priority(level as u8),
                        self.starvation_threshold - 1
                    );
                    self.droplets[level] = 0;
                } else {
                    return Some(level);
                }
            }
        }
        None
    }

    /// Level that should send next, `None` when nothing is waiting
    pub fn get_send_queue(&mut self) -> Option<(Priority, &mut SendQueue)> {
        let level = self.select_level()?;
        Some((Priority(level as u8), &mut self.queues[level]))
    }

    /// Direct access to one level
    pub fn get_queue_by_priority(&mut self, priority: Priority) -> Result<&mut SendQueue> {
        let level = self.level_index(priority)?;
        Ok(&mut self.queues[level])
    }

    /// Roll back the look-ahead of every level, e.g. after a reconnect
    pub fn rollback_look_ahead(&mut self) {
        for queue in &mut self.queues {
            queue.rollback_look_ahead();
        }
    }

    /// Total number of queued records over all levels
    pub fn amount_of_packets(&self) -> usize {
        self.queues.iter().map(SendQueue::amount_of_packets).sum()
    }

    /// Whether any level is in the middle of a fragmented message
    pub fn is_currently_sending_split_message(&self) -> bool {
        self.split_level().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> PriorityFragmentingQueue {
        PriorityFragmentingQueue::new(&PriorityQueueConfig::default()).unwrap()
    }

    #[test]
    fn test_split_counts_and_order() {
        let mut queue = queue();
        let data: Vec<u8> = (0..65).collect();

        let handle = queue.split_and_add_message(Priority::MEDIUM, &data, 20).unwrap();
        let level = queue.get_queue_by_priority(Priority::MEDIUM).unwrap();
        assert_eq!(level.amount_of_packets(), 4);

        let mut joined = Vec::new();
        for index in 0..4 {
            let frame = level.peek(index).unwrap();
            assert_eq!(frame.handle, handle);
            assert_eq!(
                frame.tag,
                ChunkTag::Chunk {
                    index: index as u8,
                    last: index == 3
                }
            );
            joined.extend_from_slice(frame.payload);
        }
        assert_eq!(joined, data);
    }

    #[test]
    fn test_short_message_is_not_split() {
        let mut queue = queue();
        queue.split_and_add_message(Priority::HIGH, b"hello", 20).unwrap();
        let frame = queue.get_queue_by_priority(Priority::HIGH).unwrap().peek_next().unwrap();
        assert_eq!(frame.tag, ChunkTag::Whole);
        assert_eq!(frame.payload, b"hello");
    }

    #[test]
    fn test_invalid_arguments() {
        let mut queue = queue();
        let err = queue.split_and_add_message(Priority(4), b"x", 20).unwrap_err();
        assert_eq!(
            err,
            QueueError::InvalidPriority {
                priority: 4,
                levels: 4
            }
        );
        assert!(err.is_defect());

        let err = queue.split_and_add_message(Priority::LOW, b"xyz", 0).unwrap_err();
        assert_eq!(err, QueueError::InvalidChunkSize);

        let big = vec![0u8; 300];
        assert_eq!(
            queue.split_and_add_message(Priority::LOW, &big, 1),
            Err(QueueError::InvalidChunkSize)
        );
        assert_eq!(queue.amount_of_packets(), 0);
    }

    #[test]
    fn test_vital_oversize_is_demoted() {
        let mut queue = queue();
        let data = vec![7u8; 40];
        queue.split_and_add_message(Priority::VITAL, &data, 64).unwrap();

        assert_eq!(queue.get_queue_by_priority(Priority::VITAL).unwrap().amount_of_packets(), 0);
        let high = queue.get_queue_by_priority(Priority::HIGH).unwrap();
        assert_eq!(high.amount_of_packets(), 1);
        assert_eq!(high.peek_next().unwrap().payload, &data[..]);
    }

    #[test]
    fn test_vital_fits_is_never_split() {
        let mut queue = queue();
        let data = vec![1u8; 25];
        queue.split_and_add_message(Priority::VITAL, &data, 10).unwrap();
        let vital = queue.get_queue_by_priority(Priority::VITAL).unwrap();
        assert_eq!(vital.amount_of_packets(), 1);
        assert_eq!(vital.peek_next().unwrap().tag, ChunkTag::Whole);
    }

    #[test]
    fn test_vital_wins_when_nothing_is_split() {
        let mut queue = queue();
        queue.split_and_add_message(Priority::LOW, b"low", 20).unwrap();
        queue.split_and_add_message(Priority::VITAL, b"vital", 20).unwrap();

        let (priority, _) = queue.get_send_queue().unwrap();
        assert_eq!(priority, Priority::VITAL);
    }

    #[test]
    fn test_nothing_to_send() {
        let mut queue = queue();
        assert!(queue.get_send_queue().is_none());
    }

    #[test]
    fn test_partial_split_is_rolled_back() {
        let config = PriorityQueueConfig {
            level_sizes: vec![64, 64],
            ..Default::default()
        };
        let mut queue = PriorityFragmentingQueue::new(&config).unwrap();
        queue.split_and_add_message(Priority::HIGH, &[1u8; 8], 8).unwrap();

        // Each chunk takes 16 bytes, only two more fit
        let err = queue.split_and_add_message(Priority::HIGH, &[2u8; 32], 8).unwrap_err();
        assert!(matches!(err, QueueError::Full { .. }));
        let high = queue.get_queue_by_priority(Priority::HIGH).unwrap();
        assert_eq!(high.amount_of_packets(), 1);
        assert_eq!(high.peek_next().unwrap().payload, &[1u8; 8]);
    }
}
