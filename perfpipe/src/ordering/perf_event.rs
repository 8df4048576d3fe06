use crate::domain::Origin;

/// A timestamped unit of captured data tagged with the stream it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfEvent<P> {
    /// Monotonic clock, nanoseconds
    pub timestamp_ns: u64,
    pub origin: Origin,
    pub payload: P,
}

impl<P> PerfEvent<P> {
    #[must_use]
    pub fn new(timestamp_ns: u64, origin: Origin, payload: P) -> Self {
        Self { timestamp_ns, origin, payload }
    }
}
