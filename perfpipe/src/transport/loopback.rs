//! In-process transport.
//!
//! [`loopback`] returns both ends: the [`LoopbackChannel`] given to a
//! producer, and a [`LoopbackCollector`] that accepts its connections and
//! plays the collector role. The collector end can drop a connection or
//! refuse new ones to simulate transport failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{select, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use perfpipe_common::{CollectorCommand, ProducerRequest};

use super::{ProducerChannel, ProducerStream};
use crate::domain::TransportError;

/// Create a connected channel/collector pair.
#[must_use]
pub fn loopback() -> (LoopbackChannel, LoopbackCollector) {
    let (accept_tx, accept_rx) = unbounded();
    let refuse_connections = Arc::new(AtomicBool::new(false));
    (
        LoopbackChannel { accept_tx, refuse_connections: Arc::clone(&refuse_connections) },
        LoopbackCollector { accept_rx, refuse_connections },
    )
}

pub struct LoopbackChannel {
    accept_tx: Sender<LoopbackConnection>,
    refuse_connections: Arc<AtomicBool>,
}

impl ProducerChannel for LoopbackChannel {
    fn open_stream(&self) -> Result<Arc<dyn ProducerStream>, TransportError> {
        if self.refuse_connections.load(Ordering::Acquire) {
            return Err(TransportError::Refused);
        }

        let (command_tx, command_rx) = unbounded();
        let (request_tx, request_rx) = unbounded();
        let (cancel_tx, cancel_rx) = unbounded();

        self.accept_tx
            .send(LoopbackConnection { command_tx, request_rx })
            .map_err(|_| TransportError::Refused)?;

        Ok(Arc::new(LoopbackStream {
            command_rx,
            request_tx,
            cancel_tx: Mutex::new(Some(cancel_tx)),
            cancel_rx,
            cancelled: AtomicBool::new(false),
        }))
    }

    fn describe(&self) -> String {
        "loopback".to_string()
    }
}

struct LoopbackStream {
    command_rx: Receiver<CollectorCommand>,
    request_tx: Sender<ProducerRequest>,
    // Dropping the sender wakes every reader blocked on `cancel_rx`
    cancel_tx: Mutex<Option<Sender<()>>>,
    cancel_rx: Receiver<()>,
    cancelled: AtomicBool,
}

impl ProducerStream for LoopbackStream {
    fn write(&self, request: &ProducerRequest) -> Result<(), TransportError> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(TransportError::Cancelled);
        }
        self.request_tx.send(request.clone()).map_err(|_| TransportError::Closed)
    }

    fn read(&self) -> Result<CollectorCommand, TransportError> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(TransportError::Cancelled);
        }
        select! {
            recv(self.command_rx) -> command => command.map_err(|_| TransportError::Closed),
            recv(self.cancel_rx) -> _ => Err(TransportError::Cancelled),
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.cancel_tx.lock().take();
    }
}

/// Collector end of a [`loopback`] pair.
pub struct LoopbackCollector {
    accept_rx: Receiver<LoopbackConnection>,
    refuse_connections: Arc<AtomicBool>,
}

impl LoopbackCollector {
    /// Wait for the producer to open its next stream.
    #[must_use]
    pub fn accept(&self, timeout: Duration) -> Option<LoopbackConnection> {
        self.accept_rx.recv_timeout(timeout).ok()
    }

    /// While set, `open_stream` fails with [`TransportError::Refused`].
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.refuse_connections.store(refuse, Ordering::Release);
    }
}

/// Collector side of one accepted stream.
///
/// Dropping it closes the stream for the producer.
pub struct LoopbackConnection {
    command_tx: Sender<CollectorCommand>,
    request_rx: Receiver<ProducerRequest>,
}

impl LoopbackConnection {
    /// Returns false if the producer already dropped the stream.
    pub fn send(&self, command: CollectorCommand) -> bool {
        self.command_tx.send(command).is_ok()
    }

    /// Next request from the producer, or `None` on timeout or disconnect.
    #[must_use]
    pub fn recv_request(&self, timeout: Duration) -> Option<ProducerRequest> {
        match self.request_rx.recv_timeout(timeout) {
            Ok(request) => Some(request),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Requests already received, without blocking
    #[must_use]
    pub fn drain_requests(&self) -> Vec<ProducerRequest> {
        self.request_rx.try_iter().collect()
    }

    /// Simulate a transport failure.
    pub fn close(self) {}
}
