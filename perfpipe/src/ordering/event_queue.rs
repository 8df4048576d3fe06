//! # Perf Event Queue
//!
//! Imposes one global timestamp order over events coming from many streams.
//!
//! ## Layout
//!
//! ```text
//!   slot_by_origin: Origin ──▶ slot index
//!   slots:          [ Some(fd:11 → [103, 104]) | None | Some(tid:7 → [99]) ]
//!   origin_heap:    [ 2, 0 ]          (slot indices, min-heap on front timestamp)
//!   unordered:      BinaryHeap        (min-heap on timestamp)
//! ```
//!
//! Events of an ordered origin are already sorted by their source, so each
//! origin only needs a FIFO, and finding the oldest ordered event means
//! looking at the front of every FIFO: the origin heap keeps those fronts in
//! a binary heap (O(log F) for F live origins). Unordered events go to a
//! regular heap (O(log N)).
//!
//! The heap stores slot indices rather than references. A slot is only
//! released when its FIFO empties, at which point its index is also removed
//! from the heap, so every index in the heap always names a live FIFO.
//!
//! ## Tie-breaking
//!
//! When the oldest unordered event and the oldest ordered event have the same
//! timestamp, the unordered event comes out first. Within each structure,
//! equal timestamps come out in push order. The output is therefore the
//! stable sort of all pushed events by timestamp, with unordered events first
//! among equals.
//!
//! ## Threading
//!
//! Not synchronized: confine a queue to one consumer thread.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use super::PerfEvent;
use crate::domain::Origin;

/// Event plus its push sequence number, used to break timestamp ties.
#[derive(Debug)]
struct Sequenced<P> {
    seq: u64,
    event: PerfEvent<P>,
}

impl<P> Sequenced<P> {
    fn key(&self) -> (u64, u64) {
        (self.event.timestamp_ns, self.seq)
    }
}

/// Reverses the ordering so that `BinaryHeap` pops the oldest event first.
#[derive(Debug)]
struct Oldest<P>(Sequenced<P>);

impl<P> PartialEq for Oldest<P> {
    fn eq(&self, other: &Self) -> bool {
        self.0.key() == other.0.key()
    }
}

impl<P> Eq for Oldest<P> {}

impl<P> PartialOrd for Oldest<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for Oldest<P> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.key().cmp(&self.0.key())
    }
}

#[derive(Debug)]
struct OriginQueue<P> {
    origin: Origin,
    events: VecDeque<Sequenced<P>>,
}

/// Where the next event comes from
#[derive(Debug, Clone, Copy)]
enum NextSource {
    Unordered,
    OriginHeapRoot(usize),
}

/// Merges per-origin ordered streams and one unordered pool into one
/// globally ordered sequence.
#[derive(Debug)]
pub struct PerfEventQueue<P> {
    slots: Vec<Option<OriginQueue<P>>>,
    free_slots: Vec<usize>,
    slot_by_origin: HashMap<Origin, usize>,
    origin_heap: Vec<usize>,
    unordered: BinaryHeap<Oldest<P>>,
    next_seq: u64,
    len: usize,
}

impl<P> Default for PerfEventQueue<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> PerfEventQueue<P> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            slot_by_origin: HashMap::new(),
            origin_heap: Vec::new(),
            unordered: BinaryHeap::new(),
            next_seq: 0,
            len: 0,
        }
    }

    /// Add an event.
    ///
    /// # Panics
    ///
    /// If `event` belongs to an ordered origin and is older than the last
    /// event pushed for that origin: the source broke its ordering contract
    /// and the merged output could no longer be trusted.
    pub fn push_event(&mut self, event: PerfEvent<P>) {
        let origin = event.origin;
        let entry = Sequenced { seq: self.next_seq, event };
        self.next_seq += 1;
        self.len += 1;

        if !origin.is_ordered() {
            self.unordered.push(Oldest(entry));
            return;
        }

        if let Some(&slot) = self.slot_by_origin.get(&origin) {
            let queue = self.queue_mut(slot);
            if let Some(last) = queue.events.back() {
                assert!(
                    entry.event.timestamp_ns >= last.event.timestamp_ns,
                    "events from {origin} pushed out of order: {} after {}",
                    entry.event.timestamp_ns,
                    last.event.timestamp_ns
                );
            }
            queue.events.push_back(entry);
            return;
        }

        let queue = OriginQueue { origin, events: VecDeque::from([entry]) };
        let slot = if let Some(slot) = self.free_slots.pop() {
            self.slots[slot] = Some(queue);
            slot
        } else {
            self.slots.push(Some(queue));
            self.slots.len() - 1
        };
        self.slot_by_origin.insert(origin, slot);
        self.origin_heap.push(slot);
        self.sift_up_last();
    }

    /// Returns true if at least one event is queued
    #[must_use]
    pub fn has_event(&self) -> bool {
        !self.origin_heap.is_empty() || !self.unordered.is_empty()
    }

    /// Number of queued events
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Oldest queued event.
    ///
    /// # Panics
    ///
    /// If the queue is empty.
    #[must_use]
    pub fn top_event(&self) -> &PerfEvent<P> {
        match self.next_source() {
            NextSource::Unordered => match self.unordered.peek() {
                Some(Oldest(entry)) => &entry.event,
                None => unreachable!("unordered pool selected while empty"),
            },
            NextSource::OriginHeapRoot(slot) => &self.front(slot).event,
        }
    }

    /// Remove and return the event [`top_event`](Self::top_event) selects.
    ///
    /// # Panics
    ///
    /// If the queue is empty.
    pub fn pop_event(&mut self) -> PerfEvent<P> {
        let source = self.next_source();
        self.len -= 1;

        let slot = match source {
            NextSource::Unordered => match self.unordered.pop() {
                Some(Oldest(entry)) => return entry.event,
                None => unreachable!("unordered pool selected while empty"),
            },
            NextSource::OriginHeapRoot(slot) => slot,
        };

        let queue = self.queue_mut(slot);
        let Some(entry) = queue.events.pop_front() else {
            unreachable!("origin heap references an empty queue");
        };

        if queue.events.is_empty() {
            let origin = queue.origin;
            self.slot_by_origin.remove(&origin);
            self.slots[slot] = None;
            self.free_slots.push(slot);

            let last = self.origin_heap.len() - 1;
            self.origin_heap.swap(0, last);
            self.origin_heap.pop();
        }

        self.sift_down_root();
        entry.event
    }

    // Private helpers

    fn next_source(&self) -> NextSource {
        assert!(self.has_event(), "top or pop on an empty PerfEventQueue");

        let Some(&root) = self.origin_heap.first() else {
            return NextSource::Unordered;
        };
        match self.unordered.peek() {
            // Ties go to the unordered pool
            Some(Oldest(entry))
                if entry.event.timestamp_ns <= self.front(root).event.timestamp_ns =>
            {
                NextSource::Unordered
            }
            _ => NextSource::OriginHeapRoot(root),
        }
    }

    fn queue_mut(&mut self, slot: usize) -> &mut OriginQueue<P> {
        match self.slots[slot].as_mut() {
            Some(queue) => queue,
            None => unreachable!("slot {slot} is not live"),
        }
    }

    fn front(&self, slot: usize) -> &Sequenced<P> {
        match self.slots[slot].as_ref().and_then(|queue| queue.events.front()) {
            Some(entry) => entry,
            None => unreachable!("origin heap references an empty queue"),
        }
    }

    fn heap_key(&self, heap_index: usize) -> (u64, u64) {
        self.front(self.origin_heap[heap_index]).key()
    }

    fn sift_up_last(&mut self) {
        let Some(mut current) = self.origin_heap.len().checked_sub(1) else {
            return;
        };
        while current > 0 {
            let parent = (current - 1) / 2;
            if self.heap_key(parent) <= self.heap_key(current) {
                break;
            }
            self.origin_heap.swap(parent, current);
            current = parent;
        }
    }

    fn sift_down_root(&mut self) {
        let size = self.origin_heap.len();
        let mut current = 0;
        loop {
            let mut smallest = current;
            for child in [2 * current + 1, 2 * current + 2] {
                if child < size && self.heap_key(child) < self.heap_key(smallest) {
                    smallest = child;
                }
            }
            if smallest == current {
                break;
            }
            self.origin_heap.swap(smallest, current);
            current = smallest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(origin: Origin, timestamp_ns: u64) -> PerfEvent<u32> {
        PerfEvent::new(timestamp_ns, origin, 0)
    }

    fn fd(fd: i32) -> Origin {
        Origin::FileDescriptor(fd)
    }

    fn pop_timestamp(queue: &mut PerfEventQueue<u32>) -> u64 {
        let top = queue.top_event().timestamp_ns;
        let popped = queue.pop_event().timestamp_ns;
        assert_eq!(top, popped, "top and pop disagree");
        popped
    }

    #[test]
    fn test_single_origin() {
        let mut queue = PerfEventQueue::new();
        assert!(!queue.has_event());

        queue.push_event(event(fd(11), 100));
        queue.push_event(event(fd(11), 101));
        assert!(queue.has_event());
        assert_eq!(pop_timestamp(&mut queue), 100);

        queue.push_event(event(fd(11), 102));
        assert_eq!(pop_timestamp(&mut queue), 101);
        assert_eq!(pop_timestamp(&mut queue), 102);
        assert!(!queue.has_event());

        // The origin's queue was erased; pushing recreates it
        queue.push_event(event(fd(11), 103));
        assert_eq!(pop_timestamp(&mut queue), 103);
        assert!(!queue.has_event());
    }

    #[test]
    fn test_multiple_origins() {
        let mut queue = PerfEventQueue::new();

        queue.push_event(event(fd(11), 103));
        queue.push_event(event(fd(22), 101));
        queue.push_event(event(fd(22), 102));
        assert_eq!(pop_timestamp(&mut queue), 101);
        assert_eq!(pop_timestamp(&mut queue), 102);

        queue.push_event(event(fd(33), 100));
        queue.push_event(event(fd(11), 104));
        assert_eq!(pop_timestamp(&mut queue), 100);
        assert_eq!(pop_timestamp(&mut queue), 103);
        assert_eq!(pop_timestamp(&mut queue), 104);
        assert!(!queue.has_event());
    }

    #[test]
    fn test_three_origins_full_drain() {
        let mut queue = PerfEventQueue::new();
        queue.push_event(event(fd(11), 103));
        queue.push_event(event(fd(11), 104));
        queue.push_event(event(fd(22), 101));
        queue.push_event(event(fd(22), 102));
        queue.push_event(event(fd(33), 100));

        let drained: Vec<u64> = std::iter::from_fn(|| {
            queue.has_event().then(|| queue.pop_event().timestamp_ns)
        })
        .collect();
        assert_eq!(drained, vec![100, 101, 102, 103, 104]);
    }

    #[test]
    fn test_unordered_events_are_sorted() {
        let mut queue = PerfEventQueue::new();
        for timestamp in [105, 101, 104, 102, 103] {
            queue.push_event(event(Origin::Unordered, timestamp));
        }
        assert_eq!(queue.len(), 5);

        for expected in 101..=105 {
            assert_eq!(pop_timestamp(&mut queue), expected);
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_unordered_wins_ties() {
        let mut queue = PerfEventQueue::new();
        queue.push_event(PerfEvent::new(100, fd(11), 1));
        queue.push_event(PerfEvent::new(100, Origin::Unordered, 2));
        queue.push_event(PerfEvent::new(100, Origin::ThreadId(5), 3));

        assert_eq!(queue.top_event().origin, Origin::Unordered);
        assert_eq!(queue.pop_event().payload, 2);
        // Remaining ordered ties come out in push order
        assert_eq!(queue.pop_event().payload, 1);
        assert_eq!(queue.pop_event().payload, 3);
    }

    #[test]
    fn test_mixed_ordered_and_unordered() {
        let mut queue = PerfEventQueue::new();
        queue.push_event(event(fd(1), 10));
        queue.push_event(event(fd(1), 30));
        queue.push_event(event(Origin::Unordered, 20));
        queue.push_event(event(Origin::ThreadId(9), 15));
        queue.push_event(event(Origin::Unordered, 5));

        let drained: Vec<u64> = std::iter::from_fn(|| {
            queue.has_event().then(|| queue.pop_event().timestamp_ns)
        })
        .collect();
        assert_eq!(drained, vec![5, 10, 15, 20, 30]);
    }

    #[test]
    fn test_has_event_tracks_both_structures() {
        let mut queue = PerfEventQueue::new();
        queue.push_event(event(Origin::Unordered, 7));
        assert!(queue.has_event());
        let _ = queue.pop_event();
        assert!(!queue.has_event());

        queue.push_event(event(fd(3), 7));
        assert!(queue.has_event());
        let _ = queue.pop_event();
        assert!(!queue.has_event());
    }

    #[test]
    fn test_slots_are_reused() {
        let mut queue = PerfEventQueue::new();
        for round in 0..10u64 {
            for origin in 0..4 {
                queue.push_event(event(fd(origin), round * 10 + u64::try_from(origin).unwrap()));
            }
            while queue.has_event() {
                let _ = queue.pop_event();
            }
        }
        assert!(queue.slots.len() <= 4);
    }

    #[test]
    fn test_equal_timestamps_same_origin() {
        let mut queue = PerfEventQueue::new();
        queue.push_event(PerfEvent::new(50, fd(1), 1));
        queue.push_event(PerfEvent::new(50, fd(1), 2));
        queue.push_event(PerfEvent::new(50, fd(1), 3));
        assert_eq!(queue.pop_event().payload, 1);
        assert_eq!(queue.pop_event().payload, 2);
        assert_eq!(queue.pop_event().payload, 3);
    }

    #[test]
    #[should_panic(expected = "pushed out of order")]
    fn test_out_of_order_push_panics() {
        let mut queue = PerfEventQueue::new();
        queue.push_event(event(fd(11), 101));
        queue.push_event(event(fd(11), 100));
    }

    #[test]
    #[should_panic(expected = "empty PerfEventQueue")]
    fn test_pop_empty_panics() {
        let mut queue: PerfEventQueue<u32> = PerfEventQueue::new();
        let _ = queue.pop_event();
    }

    #[test]
    #[should_panic(expected = "empty PerfEventQueue")]
    fn test_top_empty_panics() {
        let queue: PerfEventQueue<u32> = PerfEventQueue::new();
        let _ = queue.top_event();
    }
}
