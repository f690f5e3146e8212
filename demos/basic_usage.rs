//! Basic usage example for the mesh ring queues
//!
//! This example demonstrates:
//! 1. Queueing messages at different priorities, split into link-sized chunks
//! 2. Handing frames to a simulated link and acknowledging them
//! 3. Persisting received data through the flash task queue as one transaction
//! 4. Driving the flash queue from completion events, the way an interrupt
//!    handler would
//!
//! The flash is a memory-mapped image in a temporary directory, which is
//! cleaned up at the end.

use mesh_ring_queue::{
    ChunkTag, FlashQueueConfig, FlashTaskQueue, MmapFlash, Priority, PriorityFragmentingQueue,
    PriorityQueueConfig, TaskOptions,
};
use std::cell::RefCell;
use std::rc::Rc;

const CHUNK_PAYLOAD: usize = 16;
const PAGE_SIZE: usize = 256;
const PAGE_COUNT: u16 = 8;
const STORAGE_PAGE: u16 = 4;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // Link side: a status report, a large configuration blob and an alarm
    let mut link = PriorityFragmentingQueue::new(&PriorityQueueConfig::default())?;
    link.split_and_add_message(Priority::LOW, b"status: battery 87%", CHUNK_PAYLOAD)?;
    let config_blob: Vec<u8> = (0..60u8).collect();
    link.split_and_add_message(Priority::MEDIUM, &config_blob, CHUNK_PAYLOAD)?;
    link.split_and_add_message(Priority::VITAL, b"ALARM", CHUNK_PAYLOAD)?;
    println!("{} frames queued", link.amount_of_packets());

    // Send everything, then acknowledge what the peer received
    let mut received = Vec::new();
    while let Some((priority, queue)) = link.get_send_queue() {
        let Some(frame) = queue.peek_look_ahead() else {
            break;
        };
        let chunk = match frame.tag {
            ChunkTag::Whole => "whole".to_string(),
            ChunkTag::Chunk { index, last } => format!("chunk {} (last: {})", index, last),
        };
        println!("{} sends {} bytes, {}", priority, frame.payload.len(), chunk);
        received.extend_from_slice(frame.payload);
        queue.advance_look_ahead();
        queue.discard_next();
    }

    // Storage side: rewrite a page with what arrived, all or nothing
    let dir = tempfile::tempdir()?;
    let flash = MmapFlash::new(dir.path().join("flash.img"), PAGE_SIZE, PAGE_COUNT)?;
    let mut storage = FlashTaskQueue::new(flash, &FlashQueueConfig::default())?;

    let committed = Rc::new(RefCell::new(None));
    let result = committed.clone();
    let address = u32::from(STORAGE_PAGE) * PAGE_SIZE as u32;

    storage.start_transaction()?;
    storage.erase_page(STORAGE_PAGE, TaskOptions::new())?;
    for (i, part) in received.chunks(64).enumerate() {
        let offset = (i * 64) as u32;
        storage.cache_and_write_data(address + offset, part, TaskOptions::new().tag(i as u32))?;
    }
    storage.end_transaction(TaskOptions::new().on_complete(move |report| {
        *result.borrow_mut() = Some(report.result);
    }))?;

    // Completion events normally arrive from the flash interrupt
    let events = storage.deliver_completions();
    println!("{} flash operations completed", events);
    println!("transaction result: {:?}", committed.borrow());

    let stored = storage.driver().read_vec(address, received.len())?;
    assert_eq!(stored, received);
    println!("{} bytes persisted at {:#x}", stored.len(), address);

    Ok(())
}
