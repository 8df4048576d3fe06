//! # Perf Event Processing
//!
//! Sits in front of [`PerfEventQueue`] and decides when events are old enough
//! to leave it.
//!
//! Each origin is read by its own reader, and readers do not run in lockstep:
//! when the queue sees an event at time T from one origin, another origin may
//! not have delivered its events older than T yet. The processor therefore
//! only releases events older than `now - processing_delay`, giving slower
//! readers that long to catch up.
//!
//! An event that arrives after younger events were already released cannot
//! be placed in order anymore. It is discarded and reported to visitors as a
//! discarded range, so a consumer knows that data is missing there.

use std::time::Duration;

use log::{debug, warn};

use super::{PerfEvent, PerfEventQueue};

/// Default age an event must reach before it is released.
pub const DEFAULT_PROCESSING_DELAY: Duration = Duration::from_millis(333);

/// Receives events released by a [`PerfEventProcessor`], in timestamp order.
pub trait PerfEventVisitor<P>: Send {
    fn visit(&mut self, event: &PerfEvent<P>);

    /// Events between `begin_timestamp_ns` and `end_timestamp_ns` arrived too
    /// late and were dropped.
    fn visit_discarded(&mut self, _begin_timestamp_ns: u64, _end_timestamp_ns: u64) {}

    /// Called after [`PerfEventProcessor::process_all_events`] released every
    /// queued event. Must not return before the visitor delivered everything
    /// it received.
    fn flush(&mut self) {}
}

pub struct PerfEventProcessor<P> {
    queue: PerfEventQueue<P>,
    visitors: Vec<Box<dyn PerfEventVisitor<P>>>,
    processing_delay_ns: u64,
    last_processed_timestamp_ns: u64,
    max_timestamp_ns: u64,
    processed_count: u64,
    discarded_count: u64,
}

impl<P> PerfEventProcessor<P> {
    /// Delays beyond `u64::MAX` nanoseconds are clamped to it.
    #[must_use]
    pub fn new(processing_delay: Duration) -> Self {
        Self {
            queue: PerfEventQueue::new(),
            visitors: Vec::new(),
            processing_delay_ns: u64::try_from(processing_delay.as_nanos()).unwrap_or(u64::MAX),
            last_processed_timestamp_ns: 0,
            max_timestamp_ns: 0,
            processed_count: 0,
            discarded_count: 0,
        }
    }

    pub fn add_visitor(&mut self, visitor: Box<dyn PerfEventVisitor<P>>) {
        self.visitors.push(visitor);
    }

    /// Queue an event, or discard it if younger events were already released.
    ///
    /// # Panics
    ///
    /// See [`PerfEventQueue::push_event`].
    pub fn add_event(&mut self, event: PerfEvent<P>) {
        if event.timestamp_ns < self.last_processed_timestamp_ns {
            self.discarded_count += 1;
            if self.discarded_count == 1 {
                warn!(
                    "Discarding event from {} at {} ns: already processed up to {} ns",
                    event.origin, event.timestamp_ns, self.last_processed_timestamp_ns
                );
            } else {
                debug!("Discarding late event from {} at {} ns", event.origin, event.timestamp_ns);
            }
            for visitor in &mut self.visitors {
                visitor.visit_discarded(event.timestamp_ns, self.last_processed_timestamp_ns);
            }
            return;
        }

        self.max_timestamp_ns = self.max_timestamp_ns.max(event.timestamp_ns);
        self.queue.push_event(event);
    }

    /// Release every event older than `now_ns - processing_delay`.
    pub fn process_old_events(&mut self, now_ns: u64) {
        let threshold = now_ns.saturating_sub(self.processing_delay_ns);
        while self.queue.has_event() && self.queue.top_event().timestamp_ns < threshold {
            self.process_top_event();
        }
    }

    /// Release everything, then flush visitors. Used when a capture stops.
    pub fn process_all_events(&mut self) {
        while self.queue.has_event() {
            self.process_top_event();
        }
        for visitor in &mut self.visitors {
            visitor.flush();
        }
    }

    #[must_use]
    pub fn processed_count(&self) -> u64 {
        self.processed_count
    }

    #[must_use]
    pub fn discarded_count(&self) -> u64 {
        self.discarded_count
    }

    /// Youngest timestamp ever queued
    #[must_use]
    pub fn max_timestamp_ns(&self) -> u64 {
        self.max_timestamp_ns
    }

    /// Number of events waiting for the delay window
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    fn process_top_event(&mut self) {
        let event = self.queue.pop_event();
        for visitor in &mut self.visitors {
            visitor.visit(&event);
        }
        self.last_processed_timestamp_ns = event.timestamp_ns;
        self.processed_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Origin;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorded {
        visited: Vec<u64>,
        discarded: Vec<(u64, u64)>,
        flushes: usize,
    }

    struct RecordingVisitor(Arc<Mutex<Recorded>>);

    impl PerfEventVisitor<()> for RecordingVisitor {
        fn visit(&mut self, event: &PerfEvent<()>) {
            self.0.lock().unwrap().visited.push(event.timestamp_ns);
        }

        fn visit_discarded(&mut self, begin: u64, end: u64) {
            self.0.lock().unwrap().discarded.push((begin, end));
        }

        fn flush(&mut self) {
            self.0.lock().unwrap().flushes += 1;
        }
    }

    fn processor_with_recorder(delay: Duration) -> (PerfEventProcessor<()>, Arc<Mutex<Recorded>>) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let mut processor = PerfEventProcessor::new(delay);
        processor.add_visitor(Box::new(RecordingVisitor(Arc::clone(&recorded))));
        (processor, recorded)
    }

    #[test]
    fn test_only_old_events_are_released() {
        let (mut processor, recorded) = processor_with_recorder(Duration::from_nanos(100));
        processor.add_event(PerfEvent::new(1_000, Origin::FileDescriptor(1), ()));
        processor.add_event(PerfEvent::new(1_050, Origin::FileDescriptor(2), ()));
        processor.add_event(PerfEvent::new(1_200, Origin::FileDescriptor(1), ()));

        processor.process_old_events(1_140);
        assert_eq!(recorded.lock().unwrap().visited, vec![1_000]);
        assert_eq!(processor.pending_count(), 2);

        processor.process_old_events(1_151);
        assert_eq!(recorded.lock().unwrap().visited, vec![1_000, 1_050]);
        assert_eq!(processor.processed_count(), 2);
        assert_eq!(processor.max_timestamp_ns(), 1_200);
    }

    #[test]
    fn test_huge_delay_is_clamped() {
        let (mut processor, recorded) = processor_with_recorder(Duration::MAX);
        processor.add_event(PerfEvent::new(1, Origin::FileDescriptor(1), ()));

        processor.process_old_events(u64::MAX);
        assert!(recorded.lock().unwrap().visited.is_empty());
        assert_eq!(processor.pending_count(), 1);
    }

    #[test]
    fn test_nothing_released_before_delay_elapsed() {
        let (mut processor, recorded) = processor_with_recorder(DEFAULT_PROCESSING_DELAY);
        processor.add_event(PerfEvent::new(5, Origin::Unordered, ()));
        processor.process_old_events(1_000);
        assert!(recorded.lock().unwrap().visited.is_empty());
    }

    #[test]
    fn test_late_events_are_discarded() {
        let (mut processor, recorded) = processor_with_recorder(Duration::from_nanos(10));
        processor.add_event(PerfEvent::new(100, Origin::FileDescriptor(1), ()));
        processor.add_event(PerfEvent::new(200, Origin::FileDescriptor(1), ()));
        processor.process_old_events(500);

        // Older than the last released event: cannot be ordered anymore
        processor.add_event(PerfEvent::new(150, Origin::FileDescriptor(2), ()));
        assert_eq!(processor.discarded_count(), 1);
        assert_eq!(processor.pending_count(), 0);
        assert_eq!(recorded.lock().unwrap().discarded, vec![(150, 200)]);

        // Same timestamp as the last released event is still fine
        processor.add_event(PerfEvent::new(200, Origin::Unordered, ()));
        assert_eq!(processor.discarded_count(), 1);
        assert_eq!(processor.pending_count(), 1);
    }

    #[test]
    fn test_process_all_events_flushes_visitors() {
        let (mut processor, recorded) = processor_with_recorder(DEFAULT_PROCESSING_DELAY);
        processor.add_event(PerfEvent::new(30, Origin::ThreadId(1), ()));
        processor.add_event(PerfEvent::new(10, Origin::Unordered, ()));
        processor.add_event(PerfEvent::new(20, Origin::ThreadId(2), ()));

        processor.process_all_events();
        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.visited, vec![10, 20, 30]);
        assert_eq!(recorded.flushes, 1);
    }
}
