//! # Buffered Capture Event Producer
//!
//! A [`CaptureEventProducer`] fed through a lock-free buffer. Any thread may
//! enqueue serialized events; a dedicated forwarder thread drains the buffer
//! into batches of at most [`MAX_EVENTS_PER_REQUEST`] events.
//!
//! The forwarder follows the capture lifecycle:
//!
//! | Status                | Behavior                                                  |
//! |-----------------------|-----------------------------------------------------------|
//! | `ForwardEvents`       | send batches as events arrive                             |
//! | `NotifyAllEventsSent` | send whatever is left, then signal AllEventsSent once     |
//! | `DropEvents`          | discard anything still buffered; no capture in progress   |
//!
//! On stop, the downstream listener is stopped first so it can push its last
//! events, and only then is the buffer closed and the final flush triggered.
//! A capture lost with its connection is not flushed: whatever it left in the
//! buffer is discarded before the next capture starts accepting events.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use perfpipe_common::{CaptureOptions, ProducerCaptureEvent, MAX_EVENTS_PER_REQUEST};

use super::{CaptureEventProducer, CaptureSessionState, CaptureStateListener};
use crate::domain::ProducerError;
use crate::transport::ProducerChannel;

/// How long the forwarder blocks before re-checking its status
const FORWARDER_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForwarderStatus {
    ForwardEvents,
    NotifyAllEventsSent,
    DropEvents,
}

struct EventBuffer {
    events_tx: Sender<ProducerCaptureEvent>,
    events_rx: Receiver<ProducerCaptureEvent>,
    accepting: AtomicBool,
    status: Mutex<ForwarderStatus>,
    status_changed: Condvar,
    shutdown_requested: AtomicBool,
    downstream: OnceLock<Arc<dyn CaptureStateListener>>,
    events_sent: AtomicU64,
    events_dropped: AtomicU64,
}

impl EventBuffer {
    fn new() -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            events_tx,
            events_rx,
            accepting: AtomicBool::new(false),
            status: Mutex::new(ForwarderStatus::DropEvents),
            status_changed: Condvar::new(),
            shutdown_requested: AtomicBool::new(false),
            downstream: OnceLock::new(),
            events_sent: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        }
    }

    fn set_status(&self, status: ForwarderStatus) {
        *self.status.lock() = status;
        self.status_changed.notify_all();
    }

    fn enqueue(&self, event: ProducerCaptureEvent) -> bool {
        if !self.accepting.load(Ordering::Acquire) {
            self.events_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        // Never fails: the buffer owns a receiver
        self.events_tx.send(event).is_ok()
    }

    fn next_batch(&self) -> Vec<ProducerCaptureEvent> {
        self.events_rx.try_iter().take(MAX_EVENTS_PER_REQUEST).collect()
    }
}

impl CaptureStateListener for EventBuffer {
    fn on_capture_start(&self, options: &CaptureOptions) {
        {
            let mut status = self.status.lock();
            // The forwarder may still be winding down a capture cut short by a
            // lost connection
            while *status == ForwarderStatus::NotifyAllEventsSent
                && !self.shutdown_requested.load(Ordering::Acquire)
            {
                self.status_changed.wait_for(&mut status, FORWARDER_POLL_INTERVAL);
            }
            let stale = self.events_rx.try_iter().count() as u64;
            if stale > 0 {
                debug!("Discarded {stale} events left over from the previous capture");
                self.events_dropped.fetch_add(stale, Ordering::Relaxed);
            }
            self.accepting.store(true, Ordering::Release);
            *status = ForwarderStatus::ForwardEvents;
        }
        self.status_changed.notify_all();
        if let Some(downstream) = self.downstream.get() {
            downstream.on_capture_start(options);
        }
    }

    fn on_capture_stop(&self) {
        if let Some(downstream) = self.downstream.get() {
            downstream.on_capture_stop();
        }
        self.accepting.store(false, Ordering::Release);
        self.set_status(ForwarderStatus::NotifyAllEventsSent);
    }

    fn on_capture_finished(&self) {
        if let Some(downstream) = self.downstream.get() {
            downstream.on_capture_finished();
        }
    }
}

/// Clonable handle for pushing events into a [`BufferedCaptureEventProducer`].
///
/// Holds the buffer weakly: a downstream listener owning a sender does not
/// keep the producer's buffer alive.
#[derive(Clone)]
pub struct CaptureEventSender {
    buffer: Weak<EventBuffer>,
}

impl CaptureEventSender {
    /// Returns false (and drops the event) when no capture is in progress or
    /// the producer is gone.
    pub fn send(&self, event: ProducerCaptureEvent) -> bool {
        self.buffer.upgrade().is_some_and(|buffer| buffer.enqueue(event))
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.buffer.upgrade().is_some_and(|buffer| buffer.accepting.load(Ordering::Acquire))
    }
}

pub struct BufferedCaptureEventProducer {
    buffer: Arc<EventBuffer>,
    producer: Arc<CaptureEventProducer>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedCaptureEventProducer {
    #[must_use]
    pub fn new() -> Self {
        let buffer = Arc::new(EventBuffer::new());
        let listener: Arc<dyn CaptureStateListener> = Arc::clone(&buffer) as _;
        Self {
            producer: Arc::new(CaptureEventProducer::new(listener)),
            buffer,
            forwarder: Mutex::new(None),
        }
    }

    /// Listener told about capture start/stop, e.g. the component that
    /// produces the events. Only the first call has an effect.
    pub fn set_downstream_listener(&self, listener: Arc<dyn CaptureStateListener>) {
        if self.buffer.downstream.set(listener).is_err() {
            warn!("Downstream capture listener already set, ignoring");
        }
    }

    /// Start the forwarder, then the underlying producer.
    ///
    /// # Errors
    ///
    /// See [`CaptureEventProducer::build_and_start`].
    pub fn build_and_start(&self, channel: Arc<dyn ProducerChannel>) -> Result<(), ProducerError> {
        let mut forwarder = self.forwarder.lock();
        if forwarder.is_some() || self.buffer.shutdown_requested.load(Ordering::Acquire) {
            return Err(ProducerError::AlreadyStarted);
        }

        let buffer = Arc::clone(&self.buffer);
        let producer = Arc::clone(&self.producer);
        let handle = thread::Builder::new()
            .name("perfpipe-forwarder".to_string())
            .spawn(move || forward_events_loop(&buffer, &producer))
            .map_err(|source| ProducerError::SpawnFailed { thread: "forwarder", source })?;
        *forwarder = Some(handle);
        drop(forwarder);

        self.producer.build_and_start(channel)
    }

    /// Stop the forwarder, then the underlying producer.
    pub fn shutdown_and_wait(&self) {
        self.buffer.shutdown_requested.store(true, Ordering::Release);
        self.buffer.status_changed.notify_all();

        let handle = self.forwarder.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Event forwarder thread panicked");
            }
        }

        self.producer.shutdown_and_wait();
    }

    /// Queue one event; dropped when no capture is in progress.
    pub fn enqueue_event(&self, event: ProducerCaptureEvent) -> bool {
        self.buffer.enqueue(event)
    }

    /// Queue events; returns how many were accepted.
    pub fn enqueue_events<I>(&self, events: I) -> usize
    where
        I: IntoIterator<Item = ProducerCaptureEvent>,
    {
        events.into_iter().map(|event| self.buffer.enqueue(event)).filter(|&accepted| accepted).count()
    }

    #[must_use]
    pub fn event_sender(&self) -> CaptureEventSender {
        CaptureEventSender { buffer: Arc::downgrade(&self.buffer) }
    }

    #[must_use]
    pub fn producer(&self) -> &CaptureEventProducer {
        &self.producer
    }

    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.producer.is_capturing()
    }

    #[must_use]
    pub fn state(&self) -> CaptureSessionState {
        self.producer.state()
    }

    /// Events handed to the collector so far
    #[must_use]
    pub fn events_sent(&self) -> u64 {
        self.buffer.events_sent.load(Ordering::Relaxed)
    }

    /// Events dropped because no capture was in progress or sending failed
    #[must_use]
    pub fn events_dropped(&self) -> u64 {
        self.buffer.events_dropped.load(Ordering::Relaxed)
    }
}

impl Default for BufferedCaptureEventProducer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BufferedCaptureEventProducer {
    fn drop(&mut self) {
        self.shutdown_and_wait();
    }
}

// ============================================================================
// Forwarder thread
// ============================================================================

fn forward_events_loop(buffer: &EventBuffer, producer: &CaptureEventProducer) {
    debug!("Event forwarder started");
    // Batch taken while forwarding but not sent because the capture stopped
    let mut carried = Vec::new();
    while !buffer.shutdown_requested.load(Ordering::Acquire) {
        let status = *buffer.status.lock();
        match status {
            ForwarderStatus::ForwardEvents => {
                match buffer.events_rx.recv_timeout(FORWARDER_POLL_INTERVAL) {
                    Ok(first) => {
                        let mut batch = Vec::with_capacity(MAX_EVENTS_PER_REQUEST);
                        batch.push(first);
                        batch.extend(buffer.events_rx.try_iter().take(MAX_EVENTS_PER_REQUEST - 1));

                        let status = buffer.status.lock();
                        if *status == ForwarderStatus::ForwardEvents {
                            send_batch(buffer, producer, batch);
                        } else {
                            carried = batch;
                        }
                    }
                    Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {}
                }
            }
            ForwarderStatus::NotifyAllEventsSent => {
                flush_stopped_capture(buffer, producer, std::mem::take(&mut carried));
            }
            ForwarderStatus::DropEvents => {
                let dropped = buffer.events_rx.try_iter().count() as u64;
                if dropped > 0 {
                    debug!("Dropped {dropped} events outside of a capture");
                    buffer.events_dropped.fetch_add(dropped, Ordering::Relaxed);
                }
                let mut status = buffer.status.lock();
                if *status == ForwarderStatus::DropEvents
                    && !buffer.shutdown_requested.load(Ordering::Acquire)
                {
                    buffer.status_changed.wait_for(&mut status, FORWARDER_POLL_INTERVAL);
                }
            }
        }
    }
    debug!("Event forwarder stopped");
}

/// Sends what is left of a stopped capture, then signals AllEventsSent.
///
/// Only a capture stopped by the collector is `Flushing`. One cut short by a
/// lost connection has nobody to flush to: its leftovers are dropped, even if
/// a new connection is already up, and nothing is signaled.
fn flush_stopped_capture(
    buffer: &EventBuffer,
    producer: &CaptureEventProducer,
    carried: Vec<ProducerCaptureEvent>,
) {
    let mut batch = carried;
    loop {
        if batch.is_empty() {
            batch = buffer.next_batch();
            if batch.is_empty() {
                break;
            }
        }
        let pending = std::mem::take(&mut batch);
        if producer.state() == CaptureSessionState::Flushing {
            send_batch(buffer, producer, pending);
        } else {
            buffer.events_dropped.fetch_add(pending.len() as u64, Ordering::Relaxed);
        }
    }

    // Only this thread moves the producer out of Flushing
    let flushing = producer.state() == CaptureSessionState::Flushing;

    // Switch before notifying so a capture started right after
    // AllEventsSent keeps its ForwardEvents status
    {
        let mut status = buffer.status.lock();
        if *status == ForwarderStatus::NotifyAllEventsSent {
            *status = ForwarderStatus::DropEvents;
        }
    }
    buffer.status_changed.notify_all();

    if !flushing {
        debug!("Capture ended without its connection, nothing to signal");
    } else if !producer.notify_all_events_sent() {
        warn!("Could not signal AllEventsSent to the collector");
    }
}

fn send_batch(buffer: &EventBuffer, producer: &CaptureEventProducer, batch: Vec<ProducerCaptureEvent>) {
    let count = batch.len() as u64;
    if producer.send_capture_events(batch) {
        buffer.events_sent.fetch_add(count, Ordering::Relaxed);
    } else {
        buffer.events_dropped.fetch_add(count, Ordering::Relaxed);
    }
}
