//! Deployment parameters for the queues
//!
//! Both configurations deserialize with serde and fall back to the defaults
//! for any missing field, so a partial config file is enough.

use crate::error::QueueError;
use crate::memory::RecordHeader;
use serde::{Deserialize, Serialize};

/// Size of the link layer send header that precedes every message
pub const LINK_SEND_HEADER_SIZE: usize = 5;

/// Configuration of a [`PriorityFragmentingQueue`](crate::PriorityFragmentingQueue)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityQueueConfig {
    /// Buffer size in bytes of every level, index 0 is VITAL
    pub level_sizes: Vec<usize>,
    /// A level that would win this many selections in a row yields once
    pub starvation_threshold: u8,
    /// Largest message the VITAL level accepts without demoting it
    pub max_vital_size: usize,
}

impl Default for PriorityQueueConfig {
    fn default() -> Self {
        Self {
            level_sizes: vec![512; 4],
            starvation_threshold: 10,
            max_vital_size: 20 + LINK_SEND_HEADER_SIZE,
        }
    }
}

impl PriorityQueueConfig {
    /// Check that the configuration can produce a working queue
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.level_sizes.len() < 2 {
            return Err(QueueError::InvalidConfig(
                "at least two priority levels are needed so VITAL can demote",
            ));
        }
        if self.level_sizes.len() > u8::MAX as usize {
            return Err(QueueError::InvalidConfig("too many priority levels"));
        }
        if self.level_sizes.iter().any(|&size| size <= RecordHeader::MIN_QUEUE_SIZE) {
            return Err(QueueError::InvalidConfig("priority level buffer too small"));
        }
        if self.starvation_threshold < 2 {
            return Err(QueueError::InvalidConfig(
                "starvation threshold below 2 lets every level yield forever",
            ));
        }
        Ok(())
    }
}

/// Configuration of a [`FlashTaskQueue`](crate::FlashTaskQueue)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashQueueConfig {
    /// Size of the task descriptor buffer in bytes
    pub queue_size: usize,
    /// Hardware errors a task may see before it is aborted
    pub retry_count: u8,
    /// Pages `0..protected_pages` can never be erased
    pub protected_pages: u16,
}

impl Default for FlashQueueConfig {
    fn default() -> Self {
        Self {
            queue_size: 256,
            retry_count: 3,
            protected_pages: 1,
        }
    }
}

impl FlashQueueConfig {
    /// Check that the configuration can produce a working queue
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.queue_size <= RecordHeader::MIN_QUEUE_SIZE {
            return Err(QueueError::InvalidConfig("flash task queue too small"));
        }
        Ok(())
    }
}
