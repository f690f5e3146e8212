//! Tests for the priority fragmenting link queue

use mesh_ring_queue::{
    ChunkTag, MessageHandle, Priority, PriorityFragmentingQueue, PriorityQueueConfig, QueueError,
};
use proptest::prelude::*;
use std::collections::HashMap;

fn default_queue() -> PriorityFragmentingQueue {
    PriorityFragmentingQueue::new(&PriorityQueueConfig::default()).unwrap()
}

#[test]
fn test_no_partial_fragmentation() {
    let config = PriorityQueueConfig {
        level_sizes: vec![64, 128, 128, 128],
        ..Default::default()
    };
    let mut queue = PriorityFragmentingQueue::new(&config).unwrap();

    // Chunks of 20 bytes take 28 bytes each, four of them fit 124 bytes
    let err = queue.split_and_add_message(Priority::LOW, &[1u8; 100], 20).unwrap_err();
    assert!(matches!(err, QueueError::Full { .. }));
    assert!(!err.is_defect());
    assert_eq!(queue.amount_of_packets(), 0);

    queue.split_and_add_message(Priority::LOW, &[2u8; 80], 20).unwrap();
    assert_eq!(queue.amount_of_packets(), 4);
}

#[test]
fn test_partial_fragmentation_keeps_older_messages() {
    let config = PriorityQueueConfig {
        level_sizes: vec![64, 128],
        ..Default::default()
    };
    let mut queue = PriorityFragmentingQueue::new(&config).unwrap();

    let first = queue.split_and_add_message(Priority::HIGH, &[1u8; 40], 20).unwrap();
    assert!(queue.split_and_add_message(Priority::HIGH, &[2u8; 60], 20).is_err());

    let high = queue.get_queue_by_priority(Priority::HIGH).unwrap();
    assert_eq!(high.amount_of_packets(), 2);
    assert_eq!(high.peek(1).unwrap().handle, first);
    assert_eq!(
        high.peek(1).unwrap().tag,
        ChunkTag::Chunk {
            index: 1,
            last: true
        }
    );
}

#[test]
fn test_vital_never_fragments() {
    let mut queue = default_queue();

    queue.split_and_add_message(Priority::VITAL, &[9u8; 60], 64).unwrap();
    assert_eq!(queue.get_queue_by_priority(Priority::VITAL).unwrap().amount_of_packets(), 0);
    assert_eq!(queue.get_queue_by_priority(Priority::HIGH).unwrap().amount_of_packets(), 1);

    // Within the ceiling VITAL takes the message whole, whatever the chunk size
    queue.split_and_add_message(Priority::VITAL, &[9u8; 25], 8).unwrap();
    let vital = queue.get_queue_by_priority(Priority::VITAL).unwrap();
    assert_eq!(vital.amount_of_packets(), 1);
    assert_eq!(vital.peek_next().unwrap().payload.len(), 25);
}

#[test]
fn test_anti_starvation() {
    let mut queue = default_queue();
    let threshold = PriorityQueueConfig::default().starvation_threshold as usize;

    for _ in 0..20 {
        queue.split_and_add_message(Priority::HIGH, b"high", 20).unwrap();
    }
    queue.split_and_add_message(Priority::LOW, b"low", 20).unwrap();

    let picks: Vec<Priority> = (0..threshold)
        .map(|_| queue.get_send_queue().map(|(priority, _)| priority).unwrap())
        .collect();
    assert!(picks.contains(&Priority::LOW), "LOW starved: {:?}", picks);
    assert_eq!(picks[0], Priority::HIGH);

    // The pattern keeps repeating while both have data
    let low_picks = (0..threshold * 5)
        .filter(|_| queue.get_send_queue().map(|(priority, _)| priority) == Some(Priority::LOW))
        .count();
    assert_eq!(low_picks, 5);
}

#[test]
fn test_skipped_level_still_sends_when_alone() {
    let mut queue = default_queue();
    queue.split_and_add_message(Priority::MEDIUM, b"only", 20).unwrap();

    for _ in 0..25 {
        let (priority, _) = queue.get_send_queue().unwrap();
        assert_eq!(priority, Priority::MEDIUM);
    }
}

#[test]
fn test_mid_split_exclusivity() {
    let mut queue = default_queue();
    let handle = queue.split_and_add_message(Priority::LOW, &[5u8; 50], 20).unwrap();

    let (priority, low) = queue.get_send_queue().unwrap();
    assert_eq!(priority, Priority::LOW);
    assert_eq!(low.peek_look_ahead().unwrap().handle, handle);
    low.advance_look_ahead();
    assert!(queue.is_currently_sending_split_message());

    queue.split_and_add_message(Priority::VITAL, b"urgent", 20).unwrap();
    queue.split_and_add_message(Priority::HIGH, b"high", 20).unwrap();

    for index in 1..3u8 {
        let (priority, low) = queue.get_send_queue().unwrap();
        assert_eq!(priority, Priority::LOW);
        let frame = low.peek_look_ahead().unwrap();
        assert_eq!(frame.handle, handle);
        assert_eq!(
            frame.tag,
            ChunkTag::Chunk {
                index,
                last: index == 2
            }
        );
        low.advance_look_ahead();
    }

    assert!(!queue.is_currently_sending_split_message());
    let (priority, _) = queue.get_send_queue().unwrap();
    assert_eq!(priority, Priority::VITAL);
}

#[test]
fn test_mid_split_without_look_ahead() {
    let mut queue = default_queue();
    queue.split_and_add_message(Priority::MEDIUM, &[5u8; 30], 20).unwrap();

    let (_, medium) = queue.get_send_queue().unwrap();
    medium.discard_next();
    queue.split_and_add_message(Priority::VITAL, b"urgent", 20).unwrap();

    let (priority, medium) = queue.get_send_queue().unwrap();
    assert_eq!(priority, Priority::MEDIUM);
    medium.discard_next();

    let (priority, _) = queue.get_send_queue().unwrap();
    assert_eq!(priority, Priority::VITAL);
}

#[test]
fn test_rollback_replays_verbatim() {
    let mut queue = default_queue();
    queue.split_and_add_message(Priority::HIGH, b"one", 20).unwrap();
    queue.split_and_add_message(Priority::HIGH, b"two", 20).unwrap();

    for _ in 0..2 {
        let (_, high) = queue.get_send_queue().unwrap();
        high.advance_look_ahead();
    }
    assert!(queue.get_send_queue().is_none());

    queue.rollback_look_ahead();
    let (_, high) = queue.get_send_queue().unwrap();
    assert_eq!(high.peek_look_ahead().unwrap().payload, b"one");
    assert_eq!(queue.amount_of_packets(), 2);
}

#[test]
fn test_rollback_inside_a_split_message() {
    let mut queue = default_queue();
    let handle = queue.split_and_add_message(Priority::MEDIUM, &[3u8; 60], 20).unwrap();

    let (_, medium) = queue.get_send_queue().unwrap();
    medium.advance_look_ahead();
    medium.advance_look_ahead();
    // Only the first chunk was acknowledged before the link dropped
    medium.discard_next();

    queue.split_and_add_message(Priority::VITAL, b"urgent", 20).unwrap();
    queue.rollback_look_ahead();

    // The peer already has chunk 0, so the message has to be completed first
    let (priority, medium) = queue.get_send_queue().unwrap();
    assert_eq!(priority, Priority::MEDIUM);
    let frame = medium.peek_look_ahead().unwrap();
    assert_eq!(frame.handle, handle);
    assert_eq!(
        frame.tag,
        ChunkTag::Chunk {
            index: 1,
            last: false
        }
    );
}

#[test]
fn test_invalid_priority_is_a_defect() {
    let mut queue = default_queue();
    let err = queue.split_and_add_message(Priority(7), b"x", 20).unwrap_err();
    assert!(err.is_defect());
    assert!(queue.get_queue_by_priority(Priority(4)).is_err());
}

#[derive(Debug, Clone)]
enum Op {
    Add { level: u8, len: usize },
    Send,
    AckAll,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => (0u8..4, 1usize..90).prop_map(|(level, len)| Op::Add { level, len }),
        4 => Just(Op::Send),
        1 => Just(Op::AckAll),
    ]
}

proptest! {
    /// Frames handed to the link never interleave two messages and always
    /// reassemble into what was queued
    #[test]
    fn prop_chunks_are_never_interleaved(ops in prop::collection::vec(op(), 1..300)) {
        let config = PriorityQueueConfig {
            level_sizes: vec![128, 256, 256, 256],
            ..Default::default()
        };
        let mut queue = PriorityFragmentingQueue::new(&config).unwrap();
        let mut messages: HashMap<MessageHandle, Vec<u8>> = HashMap::new();
        let mut assembling: Option<(MessageHandle, u8, Vec<u8>)> = None;
        let mut handed_out = [0usize; 4];
        let mut seed = 0u8;

        for op in ops {
            match op {
                Op::Add { level, len } => {
                    seed = seed.wrapping_add(1);
                    let data: Vec<u8> = (0..len).map(|i| seed.wrapping_add(i as u8)).collect();
                    if let Ok(handle) = queue.split_and_add_message(Priority(level), &data, 20) {
                        messages.insert(handle, data);
                    }
                }
                Op::Send => {
                    let Some((priority, level)) = queue.get_send_queue() else {
                        continue;
                    };
                    let frame = level.peek_look_ahead().unwrap();
                    let (handle, tag, payload) = (frame.handle, frame.tag, frame.payload.to_vec());
                    level.advance_look_ahead();
                    handed_out[priority.index()] += 1;

                    let mut bytes = match assembling.take() {
                        Some((current, last_index, bytes)) => {
                            prop_assert_eq!(current, handle);
                            let expected = ChunkTag::Chunk {
                                index: last_index + 1,
                                last: !tag.more_follows(),
                            };
                            prop_assert_eq!(tag, expected);
                            bytes
                        }
                        None => {
                            prop_assert!(!tag.is_continuation());
                            Vec::new()
                        }
                    };
                    bytes.extend_from_slice(&payload);

                    if tag.more_follows() {
                        let index = match tag {
                            ChunkTag::Chunk { index, .. } => index,
                            ChunkTag::Whole => unreachable!(),
                        };
                        assembling = Some((handle, index, bytes));
                    } else {
                        prop_assert_eq!(Some(&bytes), messages.get(&handle));
                    }
                }
                Op::AckAll => {
                    for (level, count) in handed_out.iter_mut().enumerate() {
                        let priority = Priority(level as u8);
                        let send_queue = queue.get_queue_by_priority(priority).unwrap();
                        for _ in 0..*count {
                            send_queue.discard_next();
                        }
                        *count = 0;
                    }
                }
            }
        }
    }
}
