//! # perfpipe - Capture Event Pipeline
//!
//! perfpipe merges high-rate event streams from many independently ordered
//! sources into one time-ordered capture, serializes it on an elastic worker
//! pool, and streams the result to a collector over an unreliable transport.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Event readers (one per ring buffer / thread)       │
//! │     ordered per origin  ─────┐        ┌─────  unordered         │
//! └──────────────────────────────┼────────┼─────────────────────────┘
//!                                ▼        ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  PerfEventProcessor ── PerfEventQueue (k-way merge + min-heap)   │
//! │         releases events older than now - processing delay       │
//! └───────────────────────────────┬─────────────────────────────────┘
//!                                 │ batches, global timestamp order
//!                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  ThreadPool (min..max workers, idle TTL)  ── serialization      │
//! └───────────────────────────────┬─────────────────────────────────┘
//!                                 │ serialized events, in order
//!                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  BufferedCaptureEventProducer ── forwarder thread               │
//! │  CaptureEventProducer ── connect / commands / reconnect loop    │
//! └───────────────────────────────┬─────────────────────────────────┘
//!                                 │ unix:/path or host:port
//!                                 ▼
//!                            Collector
//! ```
//!
//! ## Module Structure
//!
//! - [`ordering`]: [`ordering::PerfEventQueue`] and the delay-based
//!   [`ordering::PerfEventProcessor`] in front of it
//! - [`executor`]: the elastic [`executor::ThreadPool`]
//! - [`producer`]: the capture session state machine and its buffered
//!   variant
//! - [`transport`]: producer ↔ collector streams (sockets, in-process loopback)
//! - [`collector`]: a minimal collector server accepting producers
//! - [`pipeline`]: glue between the three stages above
//! - [`source`]: synthetic sample source driving the `produce` command
//! - [`config`], [`cli`]: JSON configuration and command-line parsing
//! - [`domain`]: origins and error types
//!
//! ## Capture Lifecycle
//!
//! 1. The collector sends `StartCapture`; the producer reports it to its
//!    listener, which starts feeding events.
//! 2. Events flow through the pipeline into the producer's buffer and are
//!    streamed in batches.
//! 3. The collector sends `StopCapture`; the pipeline drains every queued
//!    event, the buffer flushes, and the producer answers with exactly one
//!    `AllEventsSent`.
//!
//! If the connection drops, an active capture is stopped locally and the
//! producer reconnects after a fixed delay (5000 ms by default) until it is
//! shut down.

// Expose modules for testing
pub mod cli;
pub mod collector;
pub mod config;
pub mod domain;
pub mod executor;
pub mod ordering;
pub mod pipeline;
pub mod producer;
pub mod source;
pub mod transport;
