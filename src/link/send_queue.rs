//! One priority level of a link's outbound queue
//!
//! Besides the read position of the underlying record queue, a send queue
//! keeps a look-ahead position. The link layer looks ahead when it hands a
//! frame to the radio and only discards the frame once it was acknowledged.
//! When a connection is re-established the radio has forgotten everything
//! that was handed to it, so the look-ahead is rolled back to the read
//! position and the frames are sent again verbatim.

use crate::error::Result;
use crate::link::{ChunkTag, Frame, MessageHandle, Priority};
use crate::memory::circular::CircularRecordQueue;
use log::error;

/// Record queue of one priority level with look-ahead and split tracking
#[derive(Debug)]
pub struct SendQueue {
    priority: Priority,
    records: CircularRecordQueue,
    /// Records between the read position and the look-ahead position
    look_ahead: usize,
    /// A chunk with more chunks after it was the last one handed out
    sending_split: bool,
}

impl SendQueue {
    pub(crate) fn new(priority: Priority, buffer_size: usize) -> Result<Self> {
        Ok(Self {
            priority,
            records: CircularRecordQueue::with_capacity(buffer_size)?,
            look_ahead: 0,
            sending_split: false,
        })
    }

    /// Priority level served by this queue
    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn push(
        &mut self,
        tag: ChunkTag,
        handle: MessageHandle,
        payload: &[u8],
    ) -> Result<()> {
        let record = self.records.reserve(Frame::PREFIX_SIZE + payload.len())?;
        Frame::encode_prefix(tag, handle, record);
        record[Frame::PREFIX_SIZE..].copy_from_slice(payload);
        Ok(())
    }

    /// Remove the newest record, used to undo a partially queued message
    pub(crate) fn undo_push(&mut self) {
        self.records.discard_last();
        self.look_ahead = self.look_ahead.min(self.records.amount_of_packets());
    }

    /// Oldest frame that was not acknowledged yet
    pub fn peek_next(&self) -> Option<Frame<'_>> {
        self.records.peek_next(0).map(Frame::decode)
    }

    /// Frame at logical position `index`, 0 being the oldest
    pub fn peek(&self, index: usize) -> Option<Frame<'_>> {
        self.records.peek_next(index).map(Frame::decode)
    }

    /// Remove the oldest frame after it was acknowledged
    ///
    /// A frame that was never looked ahead moves the look-ahead along with the
    /// read position and decides the split state itself.
    pub fn discard_next(&mut self) {
        let Some(tag) = self.peek_next().map(|frame| frame.tag) else {
            return;
        };
        if self.look_ahead > 0 {
            self.look_ahead -= 1;
        } else {
            self.sending_split = tag.more_follows();
        }
        self.records.discard_next();
    }

    /// Whether a frame exists that was not handed out yet
    pub fn has_more_to_look_ahead(&self) -> bool {
        self.look_ahead < self.records.amount_of_packets()
    }

    /// Next frame to hand out
    pub fn peek_look_ahead(&self) -> Option<Frame<'_>> {
        self.peek(self.look_ahead)
    }

    /// Mark the frame returned by [`Self::peek_look_ahead`] as handed out
    pub fn advance_look_ahead(&mut self) {
        let Some(tag) = self.peek_look_ahead().map(|frame| frame.tag) else {
            error!(target: "link", "{} queue has nothing to look ahead", self.priority);
            return;
        };
        self.sending_split = tag.more_follows();
        self.look_ahead += 1;
    }

    /// Forget every frame that was handed out but not acknowledged
    pub fn rollback_look_ahead(&mut self) {
        self.look_ahead = 0;
        // The split state may have changed: a message whose start already got
        // acknowledged must finish before anything else is sent.
        self.sending_split = self
            .peek_next()
            .map(|frame| frame.tag.is_continuation())
            .unwrap_or(false);
    }

    /// Whether this queue is in the middle of sending a fragmented message
    pub fn is_currently_sending_split_message(&self) -> bool {
        if self.sending_split && !self.has_more_to_look_ahead() {
            error!(
                target: "link",
                "{} queue is mid-split without a remaining chunk", self.priority
            );
            return false;
        }
        self.sending_split
    }

    /// Number of queued frames
    pub fn amount_of_packets(&self) -> usize {
        self.records.amount_of_packets()
    }

    /// Whether any frame is queued
    pub fn has_packets(&self) -> bool {
        !self.records.is_empty()
    }

    /// Underlying record queue
    pub fn records(&self) -> &CircularRecordQueue {
        &self.records
    }
}
