//! # Shared Wire Types (Producer ↔ Collector)
//!
//! Defines the messages exchanged between a capture event producer and the
//! collector it streams to. Both sides of the connection depend on this crate
//! so the two ends cannot drift apart.
//!
//! ## Protocol
//!
//! One bidirectional stream per connection:
//!
//! - **producer → collector**: [`ProducerRequest::BufferedCaptureEvents`]
//!   batches while a capture runs, then exactly one
//!   [`ProducerRequest::AllEventsSent`] after the capture is stopped.
//! - **collector → producer**: [`CollectorCommand::StartCapture`],
//!   [`CollectorCommand::StopCapture`] and [`CollectorCommand::CaptureFinished`].
//!
//! There is no handshake: opening a fresh stream is the whole connection
//! setup, and reconnecting is always initiated by the producer.
//!
//! Enable the `serde` feature to derive `Serialize`/`Deserialize` for every
//! message (the socket transport frames them as JSON).

// ============================================================================
// Constants
// ============================================================================

/// Address producers connect to when none is configured.
///
/// A Unix domain socket keeps producer traffic local to the machine.
pub const DEFAULT_PRODUCER_SIDE_ADDRESS: &str = "unix:/tmp/perfpipe-producer-side.sock";

/// Delay between two connection attempts of a producer (milliseconds).
///
/// This is a fixed interval, not a backoff: a producer retries at this pace
/// forever until it is shut down.
pub const DEFAULT_RECONNECTION_DELAY_MS: u64 = 5000;

/// Upper bound on the number of events carried by a single
/// [`ProducerRequest::BufferedCaptureEvents`].
pub const MAX_EVENTS_PER_REQUEST: usize = 10_000;

// ============================================================================
// Collector → Producer
// ============================================================================

/// Configuration of a capture, carried by [`CollectorCommand::StartCapture`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CaptureOptions {
    /// Identifier the collector assigned to this capture
    pub capture_id: u64,

    /// Process being profiled, if the capture targets a single process
    #[cfg_attr(feature = "serde", serde(default))]
    pub target_pid: Option<u32>,

    /// Requested sampling frequency (0 = producer default)
    #[cfg_attr(feature = "serde", serde(default))]
    pub samples_per_second: u32,
}

/// Command sent by the collector to a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum CollectorCommand {
    /// Begin producing events for a new capture
    StartCapture { options: CaptureOptions },

    /// Stop producing events; the producer flushes and answers with
    /// [`ProducerRequest::AllEventsSent`]
    StopCapture,

    /// The collector has received everything it needs for the last capture
    CaptureFinished,
}

// ============================================================================
// Producer → Collector
// ============================================================================

/// A single, already-serialized capture event.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProducerCaptureEvent {
    /// Capture timestamp (monotonic clock, nanoseconds)
    pub timestamp_ns: u64,

    /// Opaque serialized event
    pub payload: Vec<u8>,
}

/// Request written by a producer on its outgoing stream.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum ProducerRequest {
    /// A batch of events (at most [`MAX_EVENTS_PER_REQUEST`])
    BufferedCaptureEvents { events: Vec<ProducerCaptureEvent> },

    /// Terminal signal: every event of the stopped capture has been sent
    AllEventsSent,
}

impl ProducerRequest {
    /// Number of capture events carried by this request.
    #[must_use]
    pub fn event_count(&self) -> usize {
        match self {
            Self::BufferedCaptureEvents { events } => events.len(),
            Self::AllEventsSent => 0,
        }
    }
}
