//! # Producer ↔ Collector Transport
//!
//! The capture event producer only sees two traits:
//!
//! - [`ProducerChannel`] opens a fresh bidirectional stream to the collector.
//!   It is called once per connection attempt, so a channel outlives any
//!   number of broken streams.
//! - [`ProducerStream`] is one live connection. Reads block until the
//!   collector sends a command; [`ProducerStream::cancel`] unblocks them from
//!   another thread.
//!
//! Two implementations:
//!
//! - [`socket::SocketChannel`]: Unix domain or TCP socket, one JSON document
//!   per line.
//! - [`loopback::LoopbackChannel`]: in-process, backed by crossbeam channels,
//!   with a scriptable collector end for tests and demos.

pub mod loopback;
pub mod socket;

use std::sync::Arc;

use perfpipe_common::{CollectorCommand, ProducerRequest};

use crate::domain::TransportError;

pub use loopback::{loopback, LoopbackChannel, LoopbackCollector, LoopbackConnection};
pub use socket::{ProducerSideAddress, SocketChannel, DEFAULT_CONNECT_TIMEOUT};

/// One live producer-side connection.
///
/// Writes and reads may happen concurrently from different threads.
pub trait ProducerStream: Send + Sync {
    /// Send a request to the collector.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is broken or was cancelled.
    fn write(&self, request: &ProducerRequest) -> Result<(), TransportError>;

    /// Block until the collector sends the next command.
    ///
    /// # Errors
    ///
    /// Returns an error when the peer closes the connection, on I/O failure,
    /// or after [`ProducerStream::cancel`].
    fn read(&self) -> Result<CollectorCommand, TransportError>;

    /// Abort the stream, unblocking any pending [`ProducerStream::read`].
    fn cancel(&self);
}

/// Factory for producer-side streams.
pub trait ProducerChannel: Send + Sync {
    /// Open a new stream to the collector.
    ///
    /// # Errors
    ///
    /// Returns an error if the collector cannot be reached.
    fn open_stream(&self) -> Result<Arc<dyn ProducerStream>, TransportError>;

    /// Human-readable peer description for logs
    fn describe(&self) -> String;
}
