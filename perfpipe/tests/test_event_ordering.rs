use std::collections::HashMap;

use perfpipe::domain::Origin;
use perfpipe::ordering::{PerfEvent, PerfEventQueue};
use proptest::prelude::*;

/// Stream 0 is unordered, the others are ring buffer file descriptors.
fn origin_for(stream: usize) -> Origin {
    if stream == 0 {
        Origin::Unordered
    } else {
        Origin::FileDescriptor(i32::try_from(stream).unwrap())
    }
}

/// Turn arbitrary (stream, timestamp) pairs into a valid push sequence:
/// each ordered stream's timestamps are sorted, keeping the interleaving.
fn valid_push_sequence(raw: Vec<(usize, u64)>) -> Vec<PerfEvent<usize>> {
    let mut per_stream: HashMap<usize, Vec<u64>> = HashMap::new();
    for &(stream, timestamp) in &raw {
        per_stream.entry(stream).or_default().push(timestamp);
    }
    for (stream, timestamps) in &mut per_stream {
        if *stream != 0 {
            timestamps.sort_unstable();
            timestamps.reverse();
        }
    }

    raw.iter()
        .enumerate()
        .map(|(index, &(stream, timestamp))| {
            let timestamp = if stream == 0 {
                timestamp
            } else {
                per_stream.get_mut(&stream).unwrap().pop().unwrap()
            };
            PerfEvent::new(timestamp, origin_for(stream), index)
        })
        .collect()
}

fn drain(queue: &mut PerfEventQueue<usize>) -> Vec<PerfEvent<usize>> {
    let mut popped = Vec::new();
    while queue.has_event() {
        popped.push(queue.pop_event());
    }
    popped
}

proptest! {
    #[test]
    fn test_pop_order_is_merge_sort(raw in prop::collection::vec((0usize..5, 0u64..200), 0..300)) {
        let events = valid_push_sequence(raw);
        let mut expected: Vec<u64> = events.iter().map(|e| e.timestamp_ns).collect();
        expected.sort_unstable();

        let mut queue = PerfEventQueue::new();
        for event in events {
            queue.push_event(event);
        }
        prop_assert_eq!(queue.len(), expected.len());

        let popped = drain(&mut queue);
        let timestamps: Vec<u64> = popped.iter().map(|e| e.timestamp_ns).collect();
        prop_assert_eq!(timestamps, expected);
        prop_assert!(queue.is_empty());
    }

    #[test]
    fn test_unordered_wins_ties_and_origins_keep_fifo(
        raw in prop::collection::vec((0usize..4, 0u64..20), 0..200)
    ) {
        let mut queue = PerfEventQueue::new();
        for event in valid_push_sequence(raw) {
            queue.push_event(event);
        }
        let popped = drain(&mut queue);

        for pair in popped.windows(2) {
            if pair[0].timestamp_ns == pair[1].timestamp_ns && pair[1].origin == Origin::Unordered {
                prop_assert_eq!(pair[0].origin, Origin::Unordered);
            }
        }

        let mut last_index: HashMap<Origin, usize> = HashMap::new();
        for event in popped.iter().filter(|e| e.origin.is_ordered()) {
            if let Some(previous) = last_index.insert(event.origin, event.payload) {
                prop_assert!(previous < event.payload);
            }
        }
    }

    #[test]
    fn test_top_matches_pop(raw in prop::collection::vec((0usize..3, 0u64..100), 1..100)) {
        let mut queue = PerfEventQueue::new();
        for event in valid_push_sequence(raw) {
            queue.push_event(event);
        }
        while queue.has_event() {
            let (timestamp, origin, payload) = {
                let top = queue.top_event();
                (top.timestamp_ns, top.origin, top.payload)
            };
            let popped = queue.pop_event();
            prop_assert_eq!((popped.timestamp_ns, popped.origin, popped.payload), (timestamp, origin, payload));
        }
    }
}

#[test]
fn test_interleaved_push_and_pop_across_origins() {
    let mut queue = PerfEventQueue::new();
    queue.push_event(PerfEvent::new(100, Origin::ThreadId(7), 'a'));
    queue.push_event(PerfEvent::new(105, Origin::FileDescriptor(3), 'b'));
    assert_eq!(queue.pop_event().payload, 'a');

    // The ThreadId(7) queue emptied and is recreated on the next push
    queue.push_event(PerfEvent::new(103, Origin::ThreadId(7), 'c'));
    queue.push_event(PerfEvent::new(101, Origin::Unordered, 'd'));
    queue.push_event(PerfEvent::new(104, Origin::ThreadId(7), 'e'));

    let payloads: Vec<char> = std::iter::from_fn(|| queue.has_event().then(|| queue.pop_event()))
        .map(|event| event.payload)
        .collect();
    assert_eq!(payloads, vec!['d', 'c', 'e', 'b']);
}

#[test]
fn test_many_origins_drain_in_order() {
    let mut queue = PerfEventQueue::new();
    for fd in 0..64 {
        for step in 0..16_u64 {
            queue.push_event(PerfEvent::new(step * 64 + (63 - fd), Origin::FileDescriptor(fd as i32), ()));
        }
    }
    let timestamps: Vec<u64> =
        std::iter::from_fn(|| queue.has_event().then(|| queue.pop_event().timestamp_ns)).collect();
    assert_eq!(timestamps, (0..1024).collect::<Vec<_>>());
}
