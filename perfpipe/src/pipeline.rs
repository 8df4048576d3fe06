//! # Capture Pipeline
//!
//! Connects the three stages of a capture:
//!
//! ```text
//!  readers ──▶ PerfEventProcessor ──▶ BatchScheduler ──▶ ThreadPool ──▶ BufferedCaptureEventProducer
//!              (global order)         (batch_size)       (serialize)     (stream to collector)
//! ```
//!
//! Batches are serialized in parallel but delivered in the order they were
//! scheduled, so the collector receives events in timestamp order.
//!
//! [`PipelineController`] drives a pipeline from the producer's capture
//! lifecycle: events are only accepted between start and stop, and stop
//! drains every queued event before the producer signals AllEventsSent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, TryRecvError};
use log::{error, info, warn};
use parking_lot::Mutex;
use perfpipe_common::{CaptureOptions, ProducerCaptureEvent};
use serde::Serialize;

use crate::executor::ThreadPool;
use crate::ordering::{PerfEvent, PerfEventProcessor, PerfEventVisitor};
use crate::producer::{CaptureEventSender, CaptureStateListener};

/// Pipeline counters, shared with the stages that update them
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub events_received: AtomicU64,
    pub events_released: AtomicU64,
    pub batches_scheduled: AtomicU64,
    pub events_enqueued: AtomicU64,
    pub events_rejected: AtomicU64,
    pub serialization_failures: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSnapshot {
    pub events_received: u64,
    pub events_released: u64,
    pub events_discarded: u64,
    pub batches_scheduled: u64,
    pub events_enqueued: u64,
    pub events_rejected: u64,
    pub serialization_failures: u64,
}

// ============================================================================
// Delivery: in-order hand-off of serialized batches
// ============================================================================

struct BatchDelivery {
    pending: VecDeque<Receiver<Vec<ProducerCaptureEvent>>>,
    sender: CaptureEventSender,
    stats: Arc<PipelineStats>,
}

impl BatchDelivery {
    /// Enqueue the completed batches at the front of the line.
    fn deliver_ready(&mut self) {
        while let Some(front) = self.pending.front() {
            match front.try_recv() {
                Ok(batch) => {
                    self.pending.pop_front();
                    self.enqueue(batch);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.pending.pop_front();
                    error!("Serialization batch was lost");
                }
            }
        }
    }

    /// Wait for every scheduled batch and enqueue it.
    fn deliver_all(&mut self) {
        while let Some(front) = self.pending.pop_front() {
            match front.recv() {
                Ok(batch) => self.enqueue(batch),
                Err(_) => error!("Serialization batch was lost"),
            }
        }
    }

    fn enqueue(&self, batch: Vec<ProducerCaptureEvent>) {
        for event in batch {
            if self.sender.send(event) {
                self.stats.events_enqueued.fetch_add(1, Ordering::Relaxed);
            } else {
                self.stats.events_rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Visitor collecting released events into batches for the pool.
struct BatchScheduler<P> {
    pool: Arc<ThreadPool>,
    delivery: Arc<Mutex<BatchDelivery>>,
    batch: Vec<(u64, P)>,
    batch_size: usize,
    stats: Arc<PipelineStats>,
}

impl<P> BatchScheduler<P>
where
    P: Serialize + Send + 'static,
{
    fn schedule_batch(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let batch = std::mem::replace(&mut self.batch, Vec::with_capacity(self.batch_size));
        let stats = Arc::clone(&self.stats);
        let serialized = self.pool.schedule_with_result(move || serialize_batch(batch, &stats));

        self.stats.batches_scheduled.fetch_add(1, Ordering::Relaxed);
        let mut delivery = self.delivery.lock();
        delivery.pending.push_back(serialized);
        delivery.deliver_ready();
    }
}

impl<P> PerfEventVisitor<P> for BatchScheduler<P>
where
    P: Serialize + Clone + Send + 'static,
{
    fn visit(&mut self, event: &PerfEvent<P>) {
        self.stats.events_released.fetch_add(1, Ordering::Relaxed);
        self.batch.push((event.timestamp_ns, event.payload.clone()));
        if self.batch.len() >= self.batch_size {
            self.schedule_batch();
        }
    }

    fn visit_discarded(&mut self, begin_timestamp_ns: u64, end_timestamp_ns: u64) {
        warn!("Capture lost events between {begin_timestamp_ns} and {end_timestamp_ns} ns");
    }

    fn flush(&mut self) {
        self.schedule_batch();
        self.delivery.lock().deliver_all();
    }
}

fn serialize_batch<P: Serialize>(
    batch: Vec<(u64, P)>,
    stats: &PipelineStats,
) -> Vec<ProducerCaptureEvent> {
    batch
        .into_iter()
        .filter_map(|(timestamp_ns, payload)| match serde_json::to_vec(&payload) {
            Ok(payload) => Some(ProducerCaptureEvent { timestamp_ns, payload }),
            Err(e) => {
                stats.serialization_failures.fetch_add(1, Ordering::Relaxed);
                error!("Failed to serialize event at {timestamp_ns} ns: {e}");
                None
            }
        })
        .collect()
}

// ============================================================================
// Pipeline
// ============================================================================

/// Tuning knobs of a [`CapturePipeline`]
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub processing_delay: Duration,
    pub batch_size: usize,
}

pub struct CapturePipeline<P> {
    processor: PerfEventProcessor<P>,
    delivery: Arc<Mutex<BatchDelivery>>,
    stats: Arc<PipelineStats>,
}

impl<P> CapturePipeline<P>
where
    P: Serialize + Clone + Send + 'static,
{
    /// # Panics
    ///
    /// If `settings.batch_size` is 0.
    #[must_use]
    pub fn new(settings: PipelineSettings, pool: Arc<ThreadPool>, sender: CaptureEventSender) -> Self {
        assert!(settings.batch_size > 0, "pipeline batch size must be positive");

        let stats = Arc::new(PipelineStats::default());
        let delivery = Arc::new(Mutex::new(BatchDelivery {
            pending: VecDeque::new(),
            sender,
            stats: Arc::clone(&stats),
        }));

        let mut processor = PerfEventProcessor::new(settings.processing_delay);
        processor.add_visitor(Box::new(BatchScheduler {
            pool,
            delivery: Arc::clone(&delivery),
            batch: Vec::with_capacity(settings.batch_size),
            batch_size: settings.batch_size,
            stats: Arc::clone(&stats),
        }));

        Self { processor, delivery, stats }
    }

    pub fn add_events<I>(&mut self, events: I)
    where
        I: IntoIterator<Item = PerfEvent<P>>,
    {
        for event in events {
            self.stats.events_received.fetch_add(1, Ordering::Relaxed);
            self.processor.add_event(event);
        }
    }

    /// Release events older than the processing delay and hand completed
    /// batches to the producer.
    pub fn process(&mut self, now_ns: u64) {
        self.processor.process_old_events(now_ns);
        self.delivery.lock().deliver_ready();
    }

    /// Release everything and block until every batch reached the producer.
    pub fn finish_capture(&mut self) {
        self.processor.process_all_events();
        self.delivery.lock().deliver_all();
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.processor.pending_count()
    }

    #[must_use]
    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            events_received: self.stats.events_received.load(Ordering::Relaxed),
            events_released: self.stats.events_released.load(Ordering::Relaxed),
            events_discarded: self.processor.discarded_count(),
            batches_scheduled: self.stats.batches_scheduled.load(Ordering::Relaxed),
            events_enqueued: self.stats.events_enqueued.load(Ordering::Relaxed),
            events_rejected: self.stats.events_rejected.load(Ordering::Relaxed),
            serialization_failures: self.stats.serialization_failures.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

struct ControlledPipeline<P> {
    pipeline: CapturePipeline<P>,
    active: bool,
}

/// Runs a [`CapturePipeline`] only while a capture is in progress.
pub struct PipelineController<P> {
    inner: Mutex<ControlledPipeline<P>>,
    captures_completed: AtomicU64,
}

impl<P> PipelineController<P>
where
    P: Serialize + Clone + Send + 'static,
{
    #[must_use]
    pub fn new(pipeline: CapturePipeline<P>) -> Self {
        Self {
            inner: Mutex::new(ControlledPipeline { pipeline, active: false }),
            captures_completed: AtomicU64::new(0),
        }
    }

    /// Feed freshly read events and release the old ones.
    ///
    /// Returns false, dropping the events, when no capture is in progress.
    pub fn tick(&self, events: Vec<PerfEvent<P>>, now_ns: u64) -> bool {
        let mut inner = self.inner.lock();
        if !inner.active {
            return false;
        }
        inner.pipeline.add_events(events);
        inner.pipeline.process(now_ns);
        true
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    #[must_use]
    pub fn captures_completed(&self) -> u64 {
        self.captures_completed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> PipelineSnapshot {
        self.inner.lock().pipeline.snapshot()
    }
}

impl<P> CaptureStateListener for PipelineController<P>
where
    P: Serialize + Clone + Send + 'static,
{
    fn on_capture_start(&self, options: &CaptureOptions) {
        info!("Pipeline active for capture {}", options.capture_id);
        self.inner.lock().active = true;
    }

    fn on_capture_stop(&self) {
        let mut inner = self.inner.lock();
        inner.active = false;
        inner.pipeline.finish_capture();
        self.captures_completed.fetch_add(1, Ordering::Relaxed);

        let snapshot = inner.pipeline.snapshot();
        info!(
            "Capture drained: {} events released, {} discarded, {} enqueued",
            snapshot.events_released, snapshot.events_discarded, snapshot.events_enqueued
        );
    }
}
