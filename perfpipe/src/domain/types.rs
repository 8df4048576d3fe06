//! Domain types providing compile-time safety and self-documentation

use std::fmt;

/// Stream an event was read from.
///
/// Events read from the same ring buffer file descriptor, or recorded for the
/// same thread, come out of their source already sorted by timestamp. Events
/// tagged [`Origin::Unordered`] carry no such guarantee (e.g. GPU tracepoints
/// collected from several buffers) and are ordered individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Origin {
    /// No ordering guarantee relative to any other event
    Unordered,
    /// Ordered within one perf ring buffer
    FileDescriptor(i32),
    /// Ordered within one thread
    ThreadId(i32),
}

impl Origin {
    /// Returns true if events of this origin are pre-sorted by their source
    #[must_use]
    pub fn is_ordered(self) -> bool {
        !matches!(self, Origin::Unordered)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Unordered => write!(f, "unordered"),
            Origin::FileDescriptor(fd) => write!(f, "fd:{fd}"),
            Origin::ThreadId(tid) => write!(f, "tid:{tid}"),
        }
    }
}
