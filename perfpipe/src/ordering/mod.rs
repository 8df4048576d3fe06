//! Event ordering
//!
//! Merges many independently-ordered event streams plus one unordered stream
//! into a single timestamp-ordered sequence:
//! - `perf_event`: the event type shared by all stages
//! - `event_queue`: the merge structure (per-origin FIFOs + origin heap + unordered heap)
//! - `event_processor`: delay window in front of the queue, dispatch to visitors

pub mod event_processor;
pub mod event_queue;
pub mod perf_event;

pub use event_processor::{PerfEventProcessor, PerfEventVisitor, DEFAULT_PROCESSING_DELAY};
pub use event_queue::PerfEventQueue;
pub use perf_event::PerfEvent;
