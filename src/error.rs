//! Error types shared by the queues
//!
//! Every error falls into one of three kinds:
//!
//! - [`ErrorKind::Defect`]: the caller (or the integration around the queue)
//!   did something that can never succeed, e.g. an out-of-range priority or a
//!   record larger than the whole queue. These are logged where they are
//!   detected and must not be swallowed.
//! - [`ErrorKind::Recoverable`]: an ordinary back-pressure condition such as a
//!   full queue. Try again later.
//! - [`ErrorKind::HardwareFailure`]: the flash peripheral kept failing or a
//!   stored task no longer decodes. The task is aborted and reported through
//!   its callback; the queue itself keeps running.

use thiserror::Error;

/// Classification of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller or integration defect, never succeeds on retry
    Defect,
    /// Expected condition, may succeed later
    Recoverable,
    /// A flash task was aborted, retrying it as is will not help
    HardwareFailure,
}

/// Errors returned by the record queues and the priority link queue
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Not enough free space right now
    #[error("no space for a record of {needed} bytes")]
    Full {
        /// Bytes the record would occupy including its header and padding
        needed: usize,
    },
    /// Zero-length records cannot be stored, length 0 marks a wrap
    #[error("zero-length records cannot be stored")]
    EmptyRecord,
    /// The record could not fit even into an empty queue
    #[error("record of {len} bytes can never fit a queue of {capacity} bytes")]
    RecordTooLarge {
        /// Requested payload length
        len: usize,
        /// Usable capacity of the queue
        capacity: usize,
    },
    /// Priority level outside of the configured range
    #[error("priority {priority} is out of range (levels: {levels})")]
    InvalidPriority {
        /// Requested level
        priority: u8,
        /// Number of configured levels
        levels: usize,
    },
    /// The chunk size is zero or splits the message into more than 256 chunks
    #[error("chunk payload size must be non-zero and yield at most 256 chunks")]
    InvalidChunkSize,
    /// Configuration that cannot produce a working queue
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl QueueError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Full { .. } | QueueError::EmptyRecord => ErrorKind::Recoverable,
            QueueError::RecordTooLarge { .. }
            | QueueError::InvalidPriority { .. }
            | QueueError::InvalidChunkSize
            | QueueError::InvalidConfig(_) => ErrorKind::Defect,
        }
    }

    /// Shorthand for `kind() == ErrorKind::Defect`
    pub fn is_defect(&self) -> bool {
        self.kind() == ErrorKind::Defect
    }
}

/// Errors of the flash task queue
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// The task queue has no room for the descriptor
    #[error("flash task queue is full")]
    QueueFull,
    /// Retry budget exhausted, reported through the task's callback
    ///
    /// Classified as [`ErrorKind::HardwareFailure`]. Also reported to the
    /// end of a transaction that lost one of its tasks.
    #[error("flash operation timed out")]
    OperationTimedOut,
    /// A stored task failed its checksum or no longer decodes
    #[error("stored flash task is corrupted")]
    CorruptedTask,
    /// The page lies in the protected region
    #[error("page {0} is protected and must not be erased")]
    ProtectedPage(u16),
    /// A hardware completion arrived while no task was executing
    #[error("flash completion reported with no task executing")]
    NoTaskExecuting,
    /// Writes must start on a word boundary and cover whole words
    #[error("write of {len} bytes to {address:#x} is not word aligned")]
    Unaligned {
        /// Destination address
        address: u32,
        /// Length in bytes
        len: usize,
    },
    /// Empty writes and erases of zero pages are rejected
    #[error("flash task has nothing to do")]
    EmptyTask,
    /// The erase range runs past the last addressable page
    #[error("erase of {num_pages} pages from page {start_page} leaves the page range")]
    InvalidPageRange {
        /// First page
        start_page: u16,
        /// Number of pages
        num_pages: u16,
    },
    /// A transaction was started while another one is still open
    #[error("a flash transaction is already open")]
    TransactionInProgress,
    /// A transaction was ended without being started
    #[error("no flash transaction is open")]
    NoTransactionInProgress,
    /// The descriptor can never fit into the task queue
    #[error("flash task of {len} bytes can never fit the task queue")]
    TaskTooLarge {
        /// Serialized descriptor length
        len: usize,
    },
}

impl FlashError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlashError::QueueFull => ErrorKind::Recoverable,
            FlashError::OperationTimedOut | FlashError::CorruptedTask => ErrorKind::HardwareFailure,
            FlashError::ProtectedPage(_)
            | FlashError::NoTaskExecuting
            | FlashError::Unaligned { .. }
            | FlashError::EmptyTask
            | FlashError::InvalidPageRange { .. }
            | FlashError::TransactionInProgress
            | FlashError::NoTransactionInProgress
            | FlashError::TaskTooLarge { .. } => ErrorKind::Defect,
        }
    }

    /// Shorthand for `kind() == ErrorKind::Defect`
    pub fn is_defect(&self) -> bool {
        self.kind() == ErrorKind::Defect
    }
}

impl From<QueueError> for FlashError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::RecordTooLarge { len, .. } => FlashError::TaskTooLarge { len },
            QueueError::EmptyRecord => FlashError::EmptyTask,
            _ => FlashError::QueueFull,
        }
    }
}

/// Result type for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(QueueError::Full { needed: 8 }.kind(), ErrorKind::Recoverable);
        assert!(QueueError::InvalidPriority {
            priority: 9,
            levels: 4
        }
        .is_defect());
        assert!(FlashError::ProtectedPage(0).is_defect());
        assert!(FlashError::TransactionInProgress.is_defect());
        assert_eq!(FlashError::QueueFull.kind(), ErrorKind::Recoverable);
    }

    #[test]
    fn test_aborted_tasks_are_hardware_failures() {
        assert_eq!(FlashError::OperationTimedOut.kind(), ErrorKind::HardwareFailure);
        assert_eq!(FlashError::CorruptedTask.kind(), ErrorKind::HardwareFailure);
        assert!(!FlashError::OperationTimedOut.is_defect());
    }

    #[test]
    fn test_queue_error_maps_to_flash_error() {
        assert_eq!(FlashError::from(QueueError::Full { needed: 40 }), FlashError::QueueFull);
        assert_eq!(
            FlashError::from(QueueError::RecordTooLarge {
                len: 400,
                capacity: 252
            }),
            FlashError::TaskTooLarge { len: 400 }
        );
    }
}
