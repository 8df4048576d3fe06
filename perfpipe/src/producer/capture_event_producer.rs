//! # Capture Event Producer
//!
//! Keeps a connection to the collector alive and reacts to its commands.
//!
//! ## Session states
//!
//! ```text
//!  Disconnected ─▶ Connecting ─▶ WaitingForCommands ─StartCapture─▶ Capturing
//!        ▲                               ▲                             │
//!        │                               └──notify_all_events_sent── Flushing ◀─StopCapture─┘
//!        └──── transport error (any state) ─ wait reconnection delay ─┘
//! ```
//!
//! One background thread runs the connect / read-commands / reconnect loop.
//! State transitions are reported to an injected [`CaptureStateListener`];
//! the listener decides how events are produced and must eventually call
//! [`CaptureEventProducer::notify_all_events_sent`] after every stop.
//!
//! ## Locking
//!
//! Only the stream handle sits behind a lock, and that lock is never held
//! across I/O or listener calls. The capturing flag and the session state
//! are atomics.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use perfpipe_common::{
    CaptureOptions, CollectorCommand, ProducerCaptureEvent, ProducerRequest,
    DEFAULT_RECONNECTION_DELAY_MS,
};

use crate::domain::{ProducerError, TransportError};
use crate::transport::{ProducerChannel, ProducerStream};

/// Lifecycle hooks invoked by the producer's background thread.
pub trait CaptureStateListener: Send + Sync {
    /// A capture started. Begin producing events.
    fn on_capture_start(&self, options: &CaptureOptions);

    /// The capture stopped, either on request or because the connection was
    /// lost. Stop producing events, flush, then call
    /// [`CaptureEventProducer::notify_all_events_sent`].
    fn on_capture_stop(&self);

    /// The collector is done with the last capture.
    fn on_capture_finished(&self) {}
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSessionState {
    Disconnected = 0,
    Connecting = 1,
    WaitingForCommands = 2,
    Capturing = 3,
    Flushing = 4,
}

impl CaptureSessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::WaitingForCommands,
            3 => Self::Capturing,
            4 => Self::Flushing,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for CaptureSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::WaitingForCommands => "waiting for commands",
            Self::Capturing => "capturing",
            Self::Flushing => "flushing",
        };
        f.write_str(name)
    }
}

struct ProducerShared {
    listener: Arc<dyn CaptureStateListener>,
    stream: Mutex<Option<Arc<dyn ProducerStream>>>,
    is_capturing: AtomicBool,
    state: AtomicU8,
    shutdown_requested: Mutex<bool>,
    shutdown_signal: Condvar,
    reconnection_delay_ms: AtomicU64,
}

pub struct CaptureEventProducer {
    shared: Arc<ProducerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureEventProducer {
    #[must_use]
    pub fn new(listener: Arc<dyn CaptureStateListener>) -> Self {
        Self {
            shared: Arc::new(ProducerShared {
                listener,
                stream: Mutex::new(None),
                is_capturing: AtomicBool::new(false),
                state: AtomicU8::new(CaptureSessionState::Disconnected as u8),
                shutdown_requested: Mutex::new(false),
                shutdown_signal: Condvar::new(),
                reconnection_delay_ms: AtomicU64::new(DEFAULT_RECONNECTION_DELAY_MS),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Start the connection loop on a background thread.
    ///
    /// # Errors
    ///
    /// Fails if the producer was already started (or shut down), or if the
    /// thread cannot be spawned.
    pub fn build_and_start(&self, channel: Arc<dyn ProducerChannel>) -> Result<(), ProducerError> {
        let mut thread_slot = self.thread.lock();
        if thread_slot.is_some() || self.shared.is_shutdown_requested() {
            return Err(ProducerError::AlreadyStarted);
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("perfpipe-producer".to_string())
            .spawn(move || shared.connect_and_receive_commands_loop(channel.as_ref()))
            .map_err(|source| ProducerError::SpawnFailed { thread: "producer", source })?;

        *thread_slot = Some(handle);
        Ok(())
    }

    /// Stop the background thread and wait for it. Safe to call repeatedly.
    pub fn shutdown_and_wait(&self) {
        {
            let mut requested = self.shared.shutdown_requested.lock();
            *requested = true;
            self.shared.shutdown_signal.notify_all();
        }

        if let Some(stream) = self.shared.stream.lock().as_ref() {
            stream.cancel();
        }

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Capture event producer thread panicked");
            }
        }
    }

    /// Send a batch of events to the collector.
    ///
    /// Returns false if there is no connection, no capture in progress, or the
    /// write failed.
    pub fn send_capture_events(&self, events: Vec<ProducerCaptureEvent>) -> bool {
        self.shared.send_capture_events(events)
    }

    /// Tell the collector that every event of the stopped capture was sent.
    ///
    /// Valid once per stop, while [`CaptureSessionState::Flushing`]. Any
    /// other call is logged and returns false.
    pub fn notify_all_events_sent(&self) -> bool {
        self.shared.notify_all_events_sent()
    }

    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.shared.is_capturing.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn state(&self) -> CaptureSessionState {
        self.shared.state()
    }

    /// Fixed pause between two connection attempts, in whole milliseconds.
    pub fn set_reconnection_delay(&self, delay: Duration) {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.shared.reconnection_delay_ms.store(delay_ms, Ordering::Relaxed);
    }

    #[must_use]
    pub fn reconnection_delay(&self) -> Duration {
        Duration::from_millis(self.shared.reconnection_delay_ms.load(Ordering::Relaxed))
    }
}

impl Drop for CaptureEventProducer {
    fn drop(&mut self) {
        self.shutdown_and_wait();
    }
}

// ============================================================================
// Background thread
// ============================================================================

impl ProducerShared {
    fn state(&self) -> CaptureSessionState {
        CaptureSessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CaptureSessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: CaptureSessionState, to: CaptureSessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_shutdown_requested(&self) -> bool {
        *self.shutdown_requested.lock()
    }

    /// Sleeps up to `delay`. Returns true if shutdown was requested meanwhile.
    fn wait_for_shutdown(&self, delay: Duration) -> bool {
        let deadline = Instant::now().checked_add(delay);
        let mut requested = self.shutdown_requested.lock();
        while !*requested {
            match deadline {
                Some(deadline) => {
                    if self.shutdown_signal.wait_until(&mut requested, deadline).timed_out() {
                        break;
                    }
                }
                // Too far out to represent: only shutdown ends the wait
                None => self.shutdown_signal.wait(&mut requested),
            }
        }
        *requested
    }

    fn connect_and_receive_commands_loop(&self, channel: &dyn ProducerChannel) {
        info!("Capture event producer started (collector: {})", channel.describe());

        while !self.is_shutdown_requested() {
            self.set_state(CaptureSessionState::Connecting);
            match channel.open_stream() {
                Ok(stream) => {
                    if self.install_stream(&stream) {
                        info!("Connected to collector at {}", channel.describe());
                        self.receive_commands(stream.as_ref());
                        self.teardown_stream();
                    }
                    if self.is_capturing.swap(false, Ordering::AcqRel) {
                        if self.is_shutdown_requested() {
                            info!("Shutting down while capturing, stopping capture");
                        } else {
                            warn!("Connection lost while capturing, stopping capture");
                        }
                        self.listener.on_capture_stop();
                    }
                }
                Err(e) => {
                    self.set_state(CaptureSessionState::Disconnected);
                    warn!("Unable to connect to collector: {e}");
                }
            }

            let delay =
                Duration::from_millis(self.reconnection_delay_ms.load(Ordering::Relaxed));
            if self.wait_for_shutdown(delay) {
                break;
            }
            debug!("Reconnecting to collector after {delay:?}");
        }

        self.set_state(CaptureSessionState::Disconnected);
        info!("Capture event producer stopped");
    }

    /// Returns false (and cancels the stream) if shutdown raced the connect.
    fn install_stream(&self, stream: &Arc<dyn ProducerStream>) -> bool {
        let mut slot = self.stream.lock();
        if self.is_shutdown_requested() {
            stream.cancel();
            return false;
        }
        *slot = Some(Arc::clone(stream));
        self.set_state(CaptureSessionState::WaitingForCommands);
        true
    }

    fn teardown_stream(&self) {
        let mut slot = self.stream.lock();
        if let Some(stream) = slot.take() {
            stream.cancel();
        }
        self.set_state(CaptureSessionState::Disconnected);
    }

    fn receive_commands(&self, stream: &dyn ProducerStream) {
        loop {
            match stream.read() {
                Ok(command) => self.handle_command(command),
                Err(TransportError::Cancelled) => {
                    debug!("Command stream cancelled");
                    return;
                }
                Err(e) => {
                    warn!("Lost connection to collector: {e}");
                    return;
                }
            }
        }
    }

    fn handle_command(&self, command: CollectorCommand) {
        match command {
            CollectorCommand::StartCapture { options } => {
                if self.transition(
                    CaptureSessionState::WaitingForCommands,
                    CaptureSessionState::Capturing,
                ) {
                    info!("Starting capture {}", options.capture_id);
                    self.is_capturing.store(true, Ordering::Release);
                    self.listener.on_capture_start(&options);
                } else {
                    warn!(
                        "Ignoring StartCapture for capture {} while {}",
                        options.capture_id,
                        self.state()
                    );
                }
            }
            CollectorCommand::StopCapture => {
                if self.transition(CaptureSessionState::Capturing, CaptureSessionState::Flushing)
                {
                    info!("Stopping capture");
                    self.is_capturing.store(false, Ordering::Release);
                    self.listener.on_capture_stop();
                } else {
                    debug!("Ignoring StopCapture while {}", self.state());
                }
            }
            CollectorCommand::CaptureFinished => {
                debug!("Collector finished the capture");
                self.listener.on_capture_finished();
            }
        }
    }

    fn current_stream(&self) -> Option<Arc<dyn ProducerStream>> {
        self.stream.lock().clone()
    }

    fn send_capture_events(&self, events: Vec<ProducerCaptureEvent>) -> bool {
        let state = self.state();
        if !matches!(state, CaptureSessionState::Capturing | CaptureSessionState::Flushing) {
            debug!("Not sending {} events while {state}", events.len());
            return false;
        }
        let Some(stream) = self.current_stream() else {
            return false;
        };
        if events.is_empty() {
            return true;
        }

        let count = events.len();
        match stream.write(&ProducerRequest::BufferedCaptureEvents { events }) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send {count} capture events: {e}");
                false
            }
        }
    }

    fn notify_all_events_sent(&self) -> bool {
        let stream = {
            let slot = self.stream.lock();
            let Some(stream) = slot.as_ref() else {
                error!("notify_all_events_sent called without a connection");
                return false;
            };
            if !self.transition(
                CaptureSessionState::Flushing,
                CaptureSessionState::WaitingForCommands,
            ) {
                error!("notify_all_events_sent called while {}", self.state());
                return false;
            }
            Arc::clone(stream)
        };

        match stream.write(&ProducerRequest::AllEventsSent) {
            Ok(()) => {
                debug!("Sent AllEventsSent");
                true
            }
            Err(e) => {
                warn!("Failed to send AllEventsSent: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct CountingListener {
        starts: AtomicU64,
        stops: AtomicU64,
        finishes: AtomicU64,
    }

    impl CaptureStateListener for CountingListener {
        fn on_capture_start(&self, _options: &CaptureOptions) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_capture_stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn on_capture_finished(&self) {
            self.finishes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in [
            CaptureSessionState::Disconnected,
            CaptureSessionState::Connecting,
            CaptureSessionState::WaitingForCommands,
            CaptureSessionState::Capturing,
            CaptureSessionState::Flushing,
        ] {
            assert_eq!(CaptureSessionState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_default_reconnection_delay() {
        let producer = CaptureEventProducer::new(Arc::new(CountingListener::default()));
        assert_eq!(producer.reconnection_delay(), Duration::from_millis(5000));
        assert_eq!(producer.state(), CaptureSessionState::Disconnected);
    }

    #[test]
    fn test_huge_reconnection_delay_saturates() {
        let (channel, collector) = loopback();
        collector.set_refuse_connections(true);
        let producer = CaptureEventProducer::new(Arc::new(CountingListener::default()));
        producer.set_reconnection_delay(Duration::MAX);
        assert_eq!(producer.reconnection_delay(), Duration::from_millis(u64::MAX));

        producer.build_and_start(Arc::new(channel)).unwrap();
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        producer.shutdown_and_wait();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_start_twice_fails() {
        let (channel, _collector) = loopback();
        let channel: Arc<dyn ProducerChannel> = Arc::new(channel);
        let producer = CaptureEventProducer::new(Arc::new(CountingListener::default()));
        producer.build_and_start(Arc::clone(&channel)).unwrap();
        assert!(matches!(producer.build_and_start(channel), Err(ProducerError::AlreadyStarted)));
        producer.shutdown_and_wait();
    }

    #[test]
    fn test_capture_finished_reaches_listener() {
        let (channel, collector) = loopback();
        let listener = Arc::new(CountingListener::default());
        let producer = CaptureEventProducer::new(Arc::clone(&listener) as _);
        producer.build_and_start(Arc::new(channel)).unwrap();

        let connection = collector.accept(TIMEOUT).unwrap();
        connection.send(CollectorCommand::CaptureFinished);
        assert!(wait_until(|| listener.finishes.load(Ordering::SeqCst) == 1));

        producer.shutdown_and_wait();
    }

    #[test]
    fn test_notify_outside_flushing_is_rejected() {
        let (channel, collector) = loopback();
        let listener = Arc::new(CountingListener::default());
        let producer = CaptureEventProducer::new(Arc::clone(&listener) as _);
        assert!(!producer.notify_all_events_sent());

        producer.build_and_start(Arc::new(channel)).unwrap();
        let connection = collector.accept(TIMEOUT).unwrap();
        assert!(wait_until(|| producer.state() == CaptureSessionState::WaitingForCommands));
        assert!(!producer.notify_all_events_sent());

        connection.send(CollectorCommand::StartCapture { options: CaptureOptions::default() });
        assert!(wait_until(|| producer.is_capturing()));
        assert!(!producer.notify_all_events_sent());

        connection.send(CollectorCommand::StopCapture);
        assert!(wait_until(|| producer.state() == CaptureSessionState::Flushing));
        assert!(producer.notify_all_events_sent());
        assert!(!producer.notify_all_events_sent());
        assert_eq!(connection.recv_request(TIMEOUT), Some(ProducerRequest::AllEventsSent));

        producer.shutdown_and_wait();
    }

    #[test]
    fn test_start_ignored_while_flushing() {
        let (channel, collector) = loopback();
        let listener = Arc::new(CountingListener::default());
        let producer = CaptureEventProducer::new(Arc::clone(&listener) as _);
        producer.build_and_start(Arc::new(channel)).unwrap();
        let connection = collector.accept(TIMEOUT).unwrap();

        connection.send(CollectorCommand::StartCapture { options: CaptureOptions::default() });
        connection.send(CollectorCommand::StopCapture);
        connection.send(CollectorCommand::StartCapture { options: CaptureOptions::default() });
        connection.send(CollectorCommand::CaptureFinished);

        // CaptureFinished is handled after the second StartCapture
        assert!(wait_until(|| listener.finishes.load(Ordering::SeqCst) == 1));
        assert_eq!(listener.starts.load(Ordering::SeqCst), 1);
        assert_eq!(producer.state(), CaptureSessionState::Flushing);
        assert!(!producer.is_capturing());

        producer.shutdown_and_wait();
    }
}
