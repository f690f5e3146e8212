//! Queue of flash tasks executed one at a time
//!
//! A task is a record in a [`CircularRecordQueue`]. The oldest record is the
//! task being executed; it stays in the queue until the hardware reported
//! success for its last step or the retry budget ran out.
//!
//! ```text
//!          enqueue                 Success, last step
//!  Idle ------------> Executing ------------------------> next task / Idle
//!                      |    ^  \
//!           driver Err |    |   \ Error, budget left: same step again
//!                      v    |    \ Error, budget spent: abort this task only
//!               AwaitingReissue
//!                 (next timer tick counts as an Error)
//! ```
//!
//! Erase tasks walk their pages from the last to the first and skip pages
//! that already read back blank.
//!
//! Tasks queued between [`FlashTaskQueue::start_transaction`] and
//! [`FlashTaskQueue::end_transaction`] share a transaction id. None of them
//! starts before the end of the transaction is queued. If one of them cannot
//! be stored, every task of the transaction is taken out again. If one of
//! them is aborted, the tasks of the transaction behind it are dropped
//! without their callbacks, and the end of the transaction reports
//! [`FlashError::OperationTimedOut`].

use crate::config::FlashQueueConfig;
use crate::error::{FlashError, Result as QueueResult};
use crate::flash::descriptor::{Command, TaskDescriptor, NO_SLOT, NO_TRANSACTION};
use crate::flash::{
    Completion, DriverError, FlashDriver, FlashEvent, TaskOptions, TaskReport, WORD_SIZE,
};
use crate::memory::circular::CircularRecordQueue;
use log::{debug, error, trace, warn};
use std::fmt;
use std::sync::Arc;

/// Observable state of a [`FlashTaskQueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// No task is running
    Idle,
    /// The driver accepted a step and its completion is pending
    Executing,
    /// The driver refused the last call; the next timer tick retries it
    AwaitingReissue,
}

/// Caller data that cannot live inside the descriptor bytes
struct TaskSlot {
    callback: Option<Completion>,
    source: Option<Arc<[u8]>>,
}

/// Outcome of trying to start the head task's next step
enum Issue {
    Started,
    Rejected(DriverError),
    /// Page was blank, the step succeeded without hardware
    Skipped,
    /// Nothing to do in hardware, the task is done
    Completed,
    /// Checksum mismatch or a descriptor that cannot run
    Corrupted,
}

/// Pipelines erase and write tasks onto a [`FlashDriver`]
pub struct FlashTaskQueue<D: FlashDriver> {
    driver: D,
    tasks: CircularRecordQueue,
    slots: Vec<Option<TaskSlot>>,
    executing: bool,
    reissue: bool,
    retries_left: u8,
    retry_count: u8,
    protected_pages: u16,
    /// Id of the open transaction
    transaction: u8,
    transaction_counter: u8,
    on_empty: Option<Box<dyn FnMut()>>,
}

impl<D: FlashDriver> FlashTaskQueue<D> {
    /// Create an idle queue driving `driver`
    pub fn new(driver: D, config: &FlashQueueConfig) -> QueueResult<Self> {
        config.validate()?;
        Ok(Self {
            driver,
            tasks: CircularRecordQueue::with_capacity(config.queue_size)?,
            slots: Vec::new(),
            executing: false,
            reissue: false,
            retries_left: config.retry_count,
            retry_count: config.retry_count,
            protected_pages: config.protected_pages,
            transaction: NO_TRANSACTION,
            transaction_counter: NO_TRANSACTION,
            on_empty: None,
        })
    }

    /// The driven peripheral
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Mutable access to the driven peripheral
    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// Current state
    pub fn state(&self) -> TaskState {
        match (self.executing, self.reissue) {
            (false, _) => TaskState::Idle,
            (true, false) => TaskState::Executing,
            (true, true) => TaskState::AwaitingReissue,
        }
    }

    /// Queued tasks including the executing one
    pub fn number_of_active_tasks(&self) -> usize {
        self.tasks.amount_of_packets()
    }

    /// Retries the executing task has left
    pub fn retries_left(&self) -> u8 {
        self.retries_left
    }

    /// Whether tasks are currently collected into a transaction
    pub fn transaction_in_progress(&self) -> bool {
        self.transaction != NO_TRANSACTION
    }

    /// Call `handler` every time the last queued task finishes
    pub fn set_queue_empty_handler<F>(&mut self, handler: F)
    where
        F: FnMut() + 'static,
    {
        self.on_empty = Some(Box::new(handler));
    }

    /// Erase `num_pages` pages starting at `start_page`
    pub fn erase_pages(
        &mut self,
        start_page: u16,
        num_pages: u16,
        options: TaskOptions,
    ) -> Result<(), FlashError> {
        if num_pages == 0 {
            return Err(FlashError::EmptyTask);
        }
        if start_page < self.protected_pages {
            error!(target: "flash", "erase of protected page {} requested", start_page);
            return Err(FlashError::ProtectedPage(start_page));
        }
        if start_page.checked_add(num_pages - 1).is_none() {
            error!(
                target: "flash",
                "erase of {} pages from page {} overflows", num_pages, start_page
            );
            return Err(FlashError::InvalidPageRange {
                start_page,
                num_pages,
            });
        }

        let command = Command::ErasePages {
            start_page,
            num_pages,
            remaining: num_pages,
        };
        self.enqueue(command, options, None, None)
    }

    /// Erase a single page
    pub fn erase_page(&mut self, page: u16, options: TaskOptions) -> Result<(), FlashError> {
        self.erase_pages(page, 1, options)
    }

    /// Write `data` to `address` without copying it
    ///
    /// The queue keeps a reference to `data` until the task finished. Both the
    /// address and the length must be word aligned.
    pub fn write_data(
        &mut self,
        address: u32,
        data: Arc<[u8]>,
        options: TaskOptions,
    ) -> Result<(), FlashError> {
        let len = check_write(address, data.len(), true)?;
        self.enqueue(Command::WriteRef { address, len }, options, Some(data), None)
    }

    /// Copy `data` into the queue and write it to `address`
    ///
    /// The caller's buffer is free as soon as this returns. The copy is padded
    /// with `0xFF` to whole words, which leaves the flash bits behind the
    /// payload unchanged.
    pub fn cache_and_write_data(
        &mut self,
        address: u32,
        data: &[u8],
        options: TaskOptions,
    ) -> Result<(), FlashError> {
        let len = check_write(address, data.len(), false)?;
        let command = Command::WriteCached {
            address,
            len,
            crc: crc32fast::hash(data),
        };
        self.enqueue(command, options, None, Some(data))
    }

    /// Park a copy of `data` in the queue until every task before it finished
    ///
    /// Nothing is written. The task completes as soon as it reaches the head
    /// of the queue; a callback set with
    /// [`TaskOptions::on_complete_with_data`] gets the data back.
    pub fn cache_data(&mut self, data: &[u8], options: TaskOptions) -> Result<(), FlashError> {
        if data.is_empty() {
            return Err(FlashError::EmptyTask);
        }
        let len = u32::try_from(data.len())
            .map_err(|_| FlashError::TaskTooLarge { len: data.len() })?;
        self.enqueue(Command::CacheData { len }, options, None, Some(data))
    }

    /// Collect the following tasks into one transaction
    ///
    /// Fails with [`FlashError::TransactionInProgress`] while another
    /// transaction is open.
    pub fn start_transaction(&mut self) -> Result<(), FlashError> {
        if self.transaction != NO_TRANSACTION {
            error!(target: "flash", "transaction {} is still open", self.transaction);
            return Err(FlashError::TransactionInProgress);
        }

        self.transaction_counter = self.transaction_counter.wrapping_add(1).max(1);
        self.transaction = self.transaction_counter;
        debug!(target: "flash", "transaction {} started", self.transaction);
        Ok(())
    }

    /// Close the open transaction and let its tasks run
    ///
    /// The callback in `options` runs once every task of the transaction
    /// succeeded, or with [`FlashError::OperationTimedOut`] once one of them
    /// was aborted.
    pub fn end_transaction(&mut self, options: TaskOptions) -> Result<(), FlashError> {
        if self.transaction == NO_TRANSACTION {
            error!(target: "flash", "end of a transaction that was never started");
            return Err(FlashError::NoTransactionInProgress);
        }

        self.insert(Command::EndTransaction, options, None, None)?;
        debug!(target: "flash", "transaction {} queued", self.transaction);
        self.transaction = NO_TRANSACTION;
        self.process_queue(false);
        Ok(())
    }

    fn enqueue(
        &mut self,
        command: Command,
        options: TaskOptions,
        source: Option<Arc<[u8]>>,
        cached: Option<&[u8]>,
    ) -> Result<(), FlashError> {
        self.insert(command, options, source, cached)?;
        if self.transaction == NO_TRANSACTION {
            self.process_queue(false);
        }
        Ok(())
    }

    /// Store a task; inside a transaction a failure takes the whole
    /// transaction out again
    fn insert(
        &mut self,
        command: Command,
        options: TaskOptions,
        source: Option<Arc<[u8]>>,
        cached: Option<&[u8]>,
    ) -> Result<(), FlashError> {
        let TaskOptions {
            user_tag,
            aux,
            callback,
        } = options;

        let needs_slot = callback.is_some() || source.is_some();
        let slot_index = self
            .slots
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.slots.len());
        let slot = if needs_slot {
            match u16::try_from(slot_index) {
                Ok(slot) if slot != NO_SLOT => slot,
                _ => {
                    self.roll_back_transaction();
                    return Err(FlashError::QueueFull);
                }
            }
        } else {
            NO_SLOT
        };

        let descriptor = TaskDescriptor {
            command,
            transaction: self.transaction,
            slot,
            user_tag,
            aux,
        };
        let record = match self.tasks.reserve(descriptor.encoded_len()) {
            Ok(record) => record,
            Err(err) => {
                let err = FlashError::from(err);
                debug!(target: "flash", "{:?} not queued: {}", descriptor.kind(), err);
                self.roll_back_transaction();
                return Err(err);
            }
        };
        descriptor.encode(record);
        if let (Some(data), Some(offset)) = (cached, descriptor.payload_offset()) {
            record[offset..offset + data.len()].copy_from_slice(data);
        }

        if needs_slot {
            let entry = Some(TaskSlot { callback, source });
            if slot_index == self.slots.len() {
                self.slots.push(entry);
            } else {
                self.slots[slot_index] = entry;
            }
        }

        trace!(
            target: "flash",
            "queued {:?}, {} tasks active",
            descriptor.kind(),
            self.tasks.amount_of_packets()
        );
        Ok(())
    }

    /// Take every task of the open transaction back out of the queue
    ///
    /// None of them ran, so no callback is called. The transaction is closed.
    fn roll_back_transaction(&mut self) {
        let transaction = std::mem::replace(&mut self.transaction, NO_TRANSACTION);
        if transaction == NO_TRANSACTION {
            return;
        }

        let mut removed = 0;
        while let Some(task) = self.tasks.peek_last().and_then(TaskDescriptor::decode) {
            if task.transaction != transaction {
                break;
            }
            take_slot(&mut self.slots, task.slot);
            self.tasks.discard_last();
            removed += 1;
        }
        warn!(
            target: "flash",
            "transaction {} did not fit, {} queued tasks removed", transaction, removed
        );
    }

    /// Start the next hardware step
    ///
    /// Does nothing while a task is executing unless `continue_current` is set,
    /// which re-issues the current step of the head task. Tasks of a
    /// transaction that is still open wait.
    pub fn process_queue(&mut self, continue_current: bool) {
        let mut continue_current = continue_current;
        loop {
            self.driver.feed_watchdog();
            if (self.executing && !continue_current)
                || self.tasks.is_empty()
                || self.head_waits_for_transaction_end()
            {
                return;
            }

            self.executing = true;
            continue_current = match self.issue_head() {
                Issue::Started => return,
                Issue::Rejected(err) => {
                    debug!(
                        target: "flash",
                        "driver refused the call ({}), reissuing on the next tick", err
                    );
                    self.reissue = true;
                    return;
                }
                Issue::Skipped => self.step_succeeded(),
                Issue::Completed => {
                    self.finish_head(Ok(()));
                    false
                }
                Issue::Corrupted => {
                    error!(target: "flash", "dropping corrupted task");
                    self.abort_head(FlashError::CorruptedTask);
                    false
                }
            };
        }
    }

    fn head_waits_for_transaction_end(&self) -> bool {
        self.transaction != NO_TRANSACTION
            && self
                .tasks
                .peek_next(0)
                .and_then(TaskDescriptor::decode)
                .map_or(false, |task| task.transaction == self.transaction)
    }

    fn issue_head(&mut self) -> Issue {
        let Some(record) = self.tasks.peek_next(0) else {
            return Issue::Corrupted;
        };
        let Some(task) = TaskDescriptor::decode(record) else {
            return Issue::Corrupted;
        };

        let result = match task.command {
            Command::ErasePages {
                start_page,
                remaining,
                ..
            } => {
                let page = remaining
                    .checked_sub(1)
                    .and_then(|last| start_page.checked_add(last));
                let Some(page) = page else {
                    return Issue::Corrupted;
                };
                if page_is_blank(&self.driver, page) {
                    trace!(target: "flash", "page {} already blank", page);
                    return Issue::Skipped;
                }
                trace!(target: "flash", "erasing page {}", page);
                self.driver.erase_page(page)
            }
            Command::WriteRef { address, len } => {
                let source = self
                    .slots
                    .get(task.slot as usize)
                    .and_then(Option::as_ref)
                    .and_then(|slot| slot.source.as_ref());
                let Some(source) = source else {
                    return Issue::Corrupted;
                };
                self.driver.write(address, &source[..len as usize])
            }
            Command::WriteCached { address, len, crc } => {
                let payload = TaskDescriptor::cached_payload(record, len);
                if crc32fast::hash(&payload[..len as usize]) != crc {
                    warn!(target: "flash", "cached payload for {:#x} is corrupted", address);
                    return Issue::Corrupted;
                }
                self.driver.write(address, payload)
            }
            Command::CacheData { .. } => return Issue::Completed,
            Command::EndTransaction => {
                debug!(target: "flash", "transaction {} done", task.transaction);
                return Issue::Completed;
            }
        };

        match result {
            Ok(()) => Issue::Started,
            Err(err) => Issue::Rejected(err),
        }
    }

    /// Returns whether the head task has another step to run
    fn step_succeeded(&mut self) -> bool {
        self.retries_left = self.retry_count;

        let Some(record) = self.tasks.peek_next_mut(0) else {
            return false;
        };
        if let Some(TaskDescriptor {
            command: Command::ErasePages { remaining, .. },
            ..
        }) = TaskDescriptor::decode(record)
        {
            if remaining > 1 {
                TaskDescriptor::set_remaining(record, remaining - 1);
                return true;
            }
        }

        self.finish_head(Ok(()));
        false
    }

    /// Returns whether the failed step should run again
    fn step_failed(&mut self) -> bool {
        if self.retries_left > 0 {
            self.retries_left -= 1;
            warn!(target: "flash", "flash step failed, {} retries left", self.retries_left);
            return true;
        }

        error!(target: "flash", "flash task aborted after {} retries", self.retry_count);
        self.abort_head(FlashError::OperationTimedOut);
        false
    }

    fn remove_head(&mut self) {
        self.tasks.discard_next();
        self.executing = false;
        self.reissue = false;
        self.retries_left = self.retry_count;
    }

    /// Report the head task and remove it
    ///
    /// A record that no longer decodes still gives up its slot, but its
    /// callback cannot be told what it was and is dropped.
    fn finish_head(&mut self, result: Result<(), FlashError>) {
        let Some(record) = self.tasks.peek_next(0) else {
            self.remove_head();
            return;
        };
        let task = TaskDescriptor::decode(record);
        let callback = task
            .map(|task| task.slot)
            .or_else(|| TaskDescriptor::slot_of(record))
            .and_then(|slot| take_slot(&mut self.slots, slot))
            .and_then(|slot| slot.callback);
        let data = match (&callback, task) {
            (Some(Completion::WithData(_)), Some(task)) => task.payload(record).to_vec(),
            _ => Vec::new(),
        };
        self.remove_head();

        match task {
            Some(task) => {
                debug!(target: "flash", "{:?} finished: {:?}", task.kind(), result);
                if let Some(callback) = callback {
                    callback.call(task_report(&task, result), &data);
                }
            }
            None => error!(target: "flash", "undecodable task removed: {:?}", result),
        }
        self.notify_if_empty();
    }

    /// Fail the head task, together with the rest of its transaction
    fn abort_head(&mut self, err: FlashError) {
        let transaction = self
            .tasks
            .peek_next(0)
            .and_then(TaskDescriptor::decode)
            .map_or(NO_TRANSACTION, |task| task.transaction);
        self.finish_head(Err(err));

        if transaction != NO_TRANSACTION && self.drop_transaction(transaction) > 0 {
            self.notify_if_empty();
        }
    }

    /// Drop the queued tasks of `transaction` at the head of the queue
    ///
    /// Only the end of the transaction is reported.
    fn drop_transaction(&mut self, transaction: u8) -> usize {
        let mut dropped = 0;
        while let Some(task) = self.tasks.peek_next(0).and_then(TaskDescriptor::decode) {
            if task.transaction != transaction {
                break;
            }
            let callback = take_slot(&mut self.slots, task.slot).and_then(|slot| slot.callback);
            self.tasks.discard_next();
            dropped += 1;

            if let (Command::EndTransaction, Some(callback)) = (task.command, callback) {
                callback.call(task_report(&task, Err(FlashError::OperationTimedOut)), &[]);
            }
        }
        if dropped > 0 {
            warn!(
                target: "flash",
                "transaction {} aborted, {} tasks dropped", transaction, dropped
            );
        }
        dropped
    }

    fn notify_if_empty(&mut self) {
        if self.tasks.is_empty() {
            if let Some(handler) = self.on_empty.as_mut() {
                handler();
            }
        }
    }

    /// Deliver a completion event of the driver
    ///
    /// Fails with [`FlashError::NoTaskExecuting`] when no step is in flight.
    pub fn on_flash_event(&mut self, event: FlashEvent) -> Result<(), FlashError> {
        if !self.executing || self.reissue {
            error!(target: "flash", "{:?} reported with no task executing", event);
            return Err(FlashError::NoTaskExecuting);
        }
        self.handle_event(event);
        Ok(())
    }

    fn handle_event(&mut self, event: FlashEvent) {
        let continue_current = match event {
            FlashEvent::Success => self.step_succeeded(),
            FlashEvent::Error => self.step_failed(),
        };
        self.process_queue(continue_current);
    }

    /// Periodic tick, `passed_time_ds` deciseconds since the last one
    ///
    /// A call the driver refused counts as a failed step here, so a driver
    /// that stays busy eventually aborts the task.
    pub fn timer_event_handler(&mut self, passed_time_ds: u16) {
        self.driver.feed_watchdog();
        if self.reissue {
            self.reissue = false;
            trace!(target: "flash", "reissuing after {} ds", passed_time_ds);
            self.handle_event(FlashEvent::Error);
        }
    }
}

impl<D: FlashDriver> fmt::Debug for FlashTaskQueue<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashTaskQueue")
            .field("state", &self.state())
            .field("tasks", &self.tasks)
            .field("retries_left", &self.retries_left)
            .field("transaction", &self.transaction)
            .finish()
    }
}

fn take_slot(slots: &mut [Option<TaskSlot>], slot: u16) -> Option<TaskSlot> {
    if slot == NO_SLOT {
        return None;
    }
    slots.get_mut(slot as usize).and_then(Option::take)
}

fn task_report(task: &TaskDescriptor, result: Result<(), FlashError>) -> TaskReport {
    TaskReport {
        kind: task.kind(),
        user_tag: task.user_tag,
        aux: task.aux,
        result,
    }
}

fn check_write(address: u32, len: usize, whole_words: bool) -> Result<u32, FlashError> {
    if len == 0 {
        return Err(FlashError::EmptyTask);
    }
    if address as usize % WORD_SIZE != 0 || (whole_words && len % WORD_SIZE != 0) {
        error!(target: "flash", "write of {} bytes to {:#x} is not word aligned", len, address);
        return Err(FlashError::Unaligned { address, len });
    }
    u32::try_from(len).map_err(|_| FlashError::TaskTooLarge { len })
}

fn page_is_blank<D: FlashDriver>(driver: &D, page: u16) -> bool {
    let page_size = driver.page_size();
    let mut content = vec![0u8; page_size];
    let address = u32::from(page) * page_size as u32;
    match driver.read(address, &mut content) {
        Ok(()) => content.iter().all(|&byte| byte == 0xFF),
        Err(_) => false,
    }
}
