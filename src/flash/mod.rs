//! Background flash operations
//!
//! This module pipelines page erases and word writes onto a flash peripheral
//! that completes asynchronously. It consists of several components:
//!
//! - [`FlashDriver`], the interface the peripheral (or a simulation of it)
//!   implements
//! - Task descriptors stored as records of a circular queue
//! - [`FlashTaskQueue`], which runs one task at a time and retries failed
//!   hardware steps within a fixed budget
//! - Transactions: tasks queued between [`FlashTaskQueue::start_transaction`]
//!   and [`FlashTaskQueue::end_transaction`] are inserted all or nothing, and
//!   a task that is aborted drops the rest of its transaction
//! - [`MmapFlash`], a host-side device backed by a memory-mapped image file
//!
//! Completion events are delivered by the owner through
//! [`FlashTaskQueue::on_flash_event`], and a periodic tick through
//! [`FlashTaskQueue::timer_event_handler`].

mod descriptor;
#[cfg(feature = "mmap-flash")]
pub mod mmap;
pub mod task_queue;

#[cfg(feature = "mmap-flash")]
pub use mmap::MmapFlash;
pub use task_queue::{FlashTaskQueue, TaskState};

use crate::error::FlashError;
use thiserror::Error;

/// Flash word size, writes start and (by reference) end on word boundaries
pub const WORD_SIZE: usize = 4;

/// Synchronous rejection of a driver call
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// Another operation is still running
    #[error("flash peripheral is busy")]
    Busy,
    /// Address or page outside the device
    #[error("flash address out of range")]
    OutOfRange,
    /// Any other refusal
    #[error("flash driver rejected the request")]
    Rejected,
}

/// Completion of an operation that was accepted by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashEvent {
    /// The operation finished
    Success,
    /// The operation failed and may be retried
    Error,
}

/// Interface of a flash peripheral
///
/// `erase_page` and `write` start an operation and return immediately. An
/// `Ok` means the operation was accepted and exactly one [`FlashEvent`] will
/// follow; an `Err` means nothing was started.
pub trait FlashDriver {
    /// Size of an erase page in bytes
    fn page_size(&self) -> usize;

    /// Start erasing `page`
    fn erase_page(&mut self, page: u16) -> Result<(), DriverError>;

    /// Start writing `data` to `address`
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), DriverError>;

    /// Read flash content, always synchronous
    fn read(&self, address: u32, out: &mut [u8]) -> Result<(), DriverError>;

    /// Reset the hardware watchdog
    fn feed_watchdog(&mut self) {}
}

/// What a finished task did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Erase of `num_pages` pages starting at `start_page`
    ErasePages {
        /// First page
        start_page: u16,
        /// Number of pages
        num_pages: u16,
    },
    /// Write of `len` bytes to `address`
    Write {
        /// Destination
        address: u32,
        /// Bytes written, excluding padding
        len: u32,
        /// Whether the payload was copied into the queue
        cached: bool,
    },
    /// Data parked in the queue until every task before it finished
    CacheData {
        /// Length of the data
        len: u32,
    },
    /// End of a transaction
    EndTransaction,
}

/// Handed to a task's completion callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskReport {
    /// The task that finished
    pub kind: TaskKind,
    /// Caller-defined tag
    pub user_tag: u32,
    /// Caller-defined auxiliary value
    pub aux: u32,
    /// `Ok`, or why the task was aborted
    pub result: Result<(), FlashError>,
}

/// Completion callback of a task
pub type Callback = Box<dyn FnOnce(TaskReport)>;

/// Completion callback that also receives the data stored in the queue
pub type DataCallback = Box<dyn FnOnce(TaskReport, &[u8])>;

pub(crate) enum Completion {
    Report(Callback),
    WithData(DataCallback),
}

impl Completion {
    pub(crate) fn call(self, report: TaskReport, data: &[u8]) {
        match self {
            Completion::Report(callback) => callback(report),
            Completion::WithData(callback) => callback(report, data),
        }
    }
}

/// Per-task caller data
#[derive(Default)]
pub struct TaskOptions {
    pub(crate) user_tag: u32,
    pub(crate) aux: u32,
    pub(crate) callback: Option<Completion>,
}

impl TaskOptions {
    /// No tag and no callback
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the tag reported back on completion
    pub fn tag(mut self, user_tag: u32) -> Self {
        self.user_tag = user_tag;
        self
    }

    /// Set the auxiliary value reported back on completion
    pub fn aux(mut self, aux: u32) -> Self {
        self.aux = aux;
        self
    }

    /// Call `callback` once the task succeeded or was aborted
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(TaskReport) + 'static,
    {
        self.callback = Some(Completion::Report(Box::new(callback)));
        self
    }

    /// Like [`Self::on_complete`], and hand over the data the task stored
    ///
    /// Cached writes and [`FlashTaskQueue::cache_data`] pass their payload,
    /// every other task an empty slice.
    pub fn on_complete_with_data<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(TaskReport, &[u8]) + 'static,
    {
        self.callback = Some(Completion::WithData(Box::new(callback)));
        self
    }
}

impl std::fmt::Debug for TaskOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOptions")
            .field("user_tag", &self.user_tag)
            .field("aux", &self.aux)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}
