//! Host-side flash device backed by a memory-mapped image file
//!
//! The image behaves like NOR flash:
//!
//! - Erasing a page sets every byte of it to `0xFF`
//! - Writing can only clear bits, so the stored byte is `old & new`
//! - Only one operation runs at a time; a second call while a completion is
//!   still pending is refused with [`DriverError::Busy`]
//!
//! Operations take effect immediately and queue their [`FlashEvent`], which
//! the owner picks up with [`MmapFlash::poll_completion`] and hands to the
//! task queue, the same way an interrupt handler would.

use crate::flash::{DriverError, FlashDriver, FlashEvent, FlashTaskQueue, WORD_SIZE};
use log::{debug, trace};
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

/// Flash device stored in a file
pub struct MmapFlash {
    /// Path to the image file
    path: PathBuf,
    /// Memory-mapped image
    mmap: MmapMut,
    page_size: usize,
    page_count: u16,
    /// Completion of the running operation, not yet picked up
    pending: Option<FlashEvent>,
    /// Operations that complete with an error without touching the image
    fail_next: usize,
    /// Calls that are refused as busy
    refuse_next: usize,
}

impl MmapFlash {
    /// Create or open a flash image at the given path
    ///
    /// A new file is created fully erased. An existing file must have
    /// exactly `page_size * page_count` bytes.
    pub fn new<P: AsRef<Path>>(path: P, page_size: usize, page_count: u16) -> io::Result<Self> {
        if page_size == 0 || page_size % WORD_SIZE != 0 || page_count == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid flash geometry"));
        }

        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;

        let size = page_size * page_count as usize;
        let file_size = file.metadata()?.len();
        let is_new = file_size == 0;
        if is_new {
            file.set_len(size as u64)?;
        } else if file_size != size as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("flash image has {} bytes, expected {}", file_size, size),
            ));
        }

        // SAFETY: the file is opened read-write and not shared with other
        // mappings created by this crate
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        if is_new {
            mmap.fill(0xFF);
            mmap.flush()?;
        }
        debug!(
            target: "flash",
            "opened {} pages of {} bytes at {}",
            page_count,
            page_size,
            path.display()
        );

        Ok(Self {
            path,
            mmap,
            page_size,
            page_count,
            pending: None,
            fail_next: 0,
            refuse_next: 0,
        })
    }

    /// Path of the image file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of pages
    pub fn page_count(&self) -> u16 {
        self.page_count
    }

    /// Image size in bytes
    pub fn size(&self) -> usize {
        self.page_size * self.page_count as usize
    }

    /// Take the completion of the running operation, if it finished
    pub fn poll_completion(&mut self) -> Option<FlashEvent> {
        self.pending.take()
    }

    /// Let the next `n` accepted operations fail without changing the image
    pub fn fail_next(&mut self, n: usize) {
        self.fail_next = n;
    }

    /// Refuse the next `n` calls as busy
    pub fn refuse_next(&mut self, n: usize) {
        self.refuse_next = n;
    }

    /// Flush the image to disk
    pub fn flush(&self) -> io::Result<()> {
        self.mmap.flush()
    }

    /// Copy of `len` bytes at `address`
    pub fn read_vec(&self, address: u32, len: usize) -> Result<Vec<u8>, DriverError> {
        let mut out = vec![0u8; len];
        self.read(address, &mut out)?;
        Ok(out)
    }

    /// Common checks of every operation; `Ok(false)` means "fail it"
    fn begin(&mut self) -> Result<bool, DriverError> {
        if self.pending.is_some() {
            return Err(DriverError::Busy);
        }
        if self.refuse_next > 0 {
            self.refuse_next -= 1;
            return Err(DriverError::Busy);
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            self.pending = Some(FlashEvent::Error);
            return Ok(false);
        }
        Ok(true)
    }

    fn range(&self, address: u32, len: usize) -> Result<std::ops::Range<usize>, DriverError> {
        let start = address as usize;
        let end = start.checked_add(len).ok_or(DriverError::OutOfRange)?;
        if end > self.size() {
            return Err(DriverError::OutOfRange);
        }
        Ok(start..end)
    }
}

impl FlashDriver for MmapFlash {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn erase_page(&mut self, page: u16) -> Result<(), DriverError> {
        if page >= self.page_count {
            return Err(DriverError::OutOfRange);
        }
        if !self.begin()? {
            trace!(target: "flash", "injected failure erasing page {}", page);
            return Ok(());
        }

        let start = page as usize * self.page_size;
        self.mmap[start..start + self.page_size].fill(0xFF);
        self.pending = Some(FlashEvent::Success);
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), DriverError> {
        if address as usize % WORD_SIZE != 0 || data.len() % WORD_SIZE != 0 {
            return Err(DriverError::Rejected);
        }
        let range = self.range(address, data.len())?;
        if !self.begin()? {
            trace!(target: "flash", "injected failure writing {:#x}", address);
            return Ok(());
        }

        for (cell, &byte) in self.mmap[range].iter_mut().zip(data) {
            *cell &= byte;
        }
        self.pending = Some(FlashEvent::Success);
        Ok(())
    }

    fn read(&self, address: u32, out: &mut [u8]) -> Result<(), DriverError> {
        let range = self.range(address, out.len())?;
        out.copy_from_slice(&self.mmap[range]);
        Ok(())
    }
}

impl FlashTaskQueue<MmapFlash> {
    /// Deliver completions of the image until no operation is pending
    ///
    /// Returns the number of events delivered.
    pub fn deliver_completions(&mut self) -> usize {
        let mut delivered = 0;
        while let Some(event) = self.driver_mut().poll_completion() {
            if self.on_flash_event(event).is_err() {
                break;
            }
            delivered += 1;
        }
        delivered
    }
}

impl std::fmt::Debug for MmapFlash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapFlash")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("page_count", &self.page_count)
            .field("pending", &self.pending)
            .finish()
    }
}
