//! Mesh Ring Queue - bounded record queues for a mesh node's radio link
//! and its flash storage.
//!
//! # Overview
//!
//! The crate is built from three layers over one byte-buffer primitive:
//!
//! 1. [`CircularRecordQueue`], a fixed-capacity FIFO of variable-length,
//!    word-aligned records with a reserve-then-write API
//! 2. [`PriorityFragmentingQueue`], one queue per delivery priority with
//!    all-or-nothing message fragmentation, look-ahead with rollback and an
//!    anti-starvation policy
//! 3. [`FlashTaskQueue`], a pipeline of flash erase/write tasks with exactly
//!    one task in flight and bounded retries
//!
//! # Key Features
//!
//! - Record buffers are sized once and never grow
//! - Chunks of one message are never interleaved with another message
//! - A failed flash task is reported through its own callback and never
//!   blocks the tasks behind it, unless they belong to the same transaction
//! - Flash transactions are queued as a whole or not at all
//! - Caller defects are reported as [`ErrorKind::Defect`] errors and logged
//!   through the `log` facade
//!
//! # Usage
//!
//! Everything is single-threaded and event-driven. The owner calls into the
//! queues from its main loop, its radio handler, its flash interrupt handler
//! and its timer tick; nothing blocks.

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod flash;
pub mod link;
pub mod memory;

pub use config::{FlashQueueConfig, PriorityQueueConfig};
pub use error::{ErrorKind, FlashError, QueueError};
#[cfg(feature = "mmap-flash")]
pub use flash::MmapFlash;
pub use flash::{FlashDriver, FlashEvent, FlashTaskQueue, TaskOptions, TaskReport, TaskState};
pub use link::{ChunkTag, Frame, MessageHandle, Priority, PriorityFragmentingQueue, SendQueue};
pub use memory::circular::CircularRecordQueue;
pub use memory::cursor::{Cursor, RecordRef};
