//! Structured error types for perfpipe
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Broken invariants (ordering, pool bounds) are not represented here: they
//! panic at the point of violation.

use thiserror::Error;

/// Failure of the producer ↔ collector transport.
///
/// Always recoverable: the producer drops the stream and reconnects.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect to {address}: {source}")]
    ConnectFailed {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection refused by collector")]
    Refused,

    #[error("Stream closed by peer")]
    Closed,

    #[error("Stream cancelled")]
    Cancelled,

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Producer was already started")]
    AlreadyStarted,

    #[error("Failed to spawn {thread} thread: {source}")]
    SpawnFailed {
        thread: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid producer-side address: {0}")]
    InvalidAddress(String),

    #[error("Thread pool minimum size must be at least 1")]
    ZeroMinWorkers,

    #[error("Thread pool maximum size {max} is below minimum size {min}")]
    MaxBelowMin { min: usize, max: usize },

    #[error("Idle TTL must be at least 1ms, got {0}ms")]
    IdleTtlTooSmall(u64),

    #[error("Batch size must be at least 1")]
    ZeroBatchSize,

    #[error("Failed to read config file {path}: {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
