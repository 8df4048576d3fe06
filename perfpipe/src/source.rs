//! Synthetic sample source.
//!
//! Stands in for the kernel ring buffer readers: each origin produces bursts
//! of samples whose timestamps only increase within that origin, while
//! origins drift relative to each other. A fraction of samples is emitted as
//! [`Origin::Unordered`] with jittered timestamps.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::domain::Origin;
use crate::ordering::PerfEvent;

/// One in this many samples is emitted without an ordering guarantee
const UNORDERED_ONE_IN: u32 = 8;

/// Maximum spread of a burst behind `now` (nanoseconds)
const BURST_SPREAD_NS: u64 = 2_000_000;

/// A sampled instruction pointer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleRecord {
    pub tid: i32,
    pub cpu: u32,
    pub instruction_pointer: u64,
}

struct OriginCursor {
    origin: Origin,
    last_timestamp_ns: u64,
}

pub struct SyntheticSource {
    cursors: Vec<OriginCursor>,
    rng: StdRng,
    emitted: u64,
}

impl SyntheticSource {
    /// `origins` ring buffers, seeded for reproducible runs.
    #[must_use]
    pub fn new(origins: usize, seed: u64) -> Self {
        let cursors = (0..origins)
            .map(|index| OriginCursor {
                origin: Origin::FileDescriptor(i32::try_from(index + 3).unwrap_or(i32::MAX)),
                last_timestamp_ns: 0,
            })
            .collect();
        Self { cursors, rng: StdRng::seed_from_u64(seed), emitted: 0 }
    }

    /// Read up to `per_origin` samples from every origin, all stamped at or
    /// before `now_ns`.
    ///
    /// Burst sizes vary between zero and `per_origin`, so some origins fall
    /// silent for a while and then catch up.
    pub fn read_burst(&mut self, now_ns: u64, per_origin: usize) -> Vec<PerfEvent<SampleRecord>> {
        let mut events = Vec::new();
        for cursor in &mut self.cursors {
            if cursor.last_timestamp_ns > now_ns {
                continue;
            }
            let burst = self.rng.gen_range(0..=per_origin);
            let window_start = now_ns.saturating_sub(BURST_SPREAD_NS).max(cursor.last_timestamp_ns);

            let mut timestamps: Vec<u64> =
                (0..burst).map(|_| self.rng.gen_range(window_start..=now_ns)).collect();
            timestamps.sort_unstable();

            for timestamp_ns in timestamps {
                let unordered = self.rng.gen_ratio(1, UNORDERED_ONE_IN);
                let (origin, timestamp_ns) = if unordered {
                    let jitter = self.rng.gen_range(0..=BURST_SPREAD_NS / 2);
                    (Origin::Unordered, timestamp_ns.saturating_sub(jitter))
                } else {
                    cursor.last_timestamp_ns = timestamp_ns;
                    (cursor.origin, timestamp_ns)
                };

                let tid = match cursor.origin {
                    Origin::FileDescriptor(fd) | Origin::ThreadId(fd) => fd,
                    Origin::Unordered => 0,
                };
                events.push(PerfEvent::new(
                    timestamp_ns,
                    origin,
                    SampleRecord {
                        tid,
                        cpu: self.rng.gen_range(0..8),
                        instruction_pointer: self.rng.gen_range(0x40_0000..0x80_0000),
                    },
                ));
            }
        }
        self.emitted += events.len() as u64;
        events
    }

    /// Samples produced since creation
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}
