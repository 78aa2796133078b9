//! Monotonic clock and the shared timestamp buffer
//!
//! Workers append one `(start, end)` pair per completed request into a
//! buffer shared by every worker; the sampler drains the buffer between
//! measurement windows. The buffer and the per-worker context-stat cells
//! are guarded by a single mutex so a worker publishes its timestamp and
//! its statistics snapshot in one critical section.
//!
//! Lock ordering: this mutex is never held while the wake mutex (see
//! `worker::WakeGate`) is acquired.

use std::sync::Mutex;
use std::time::Instant;

use crate::client::ContextStat;

/// Monotonic time source
///
/// Timestamps are nanoseconds elapsed since the clock was created. All
/// workers of one manager share one clock so their timestamps are mutually
/// comparable.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Create a new clock anchored at the current instant
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Nanoseconds elapsed since the clock was created
    #[must_use]
    pub fn now_ns(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// One request observation: start and end in monotonic nanoseconds
///
/// `start_ns <= end_ns` holds for every successful request; anything else
/// is a sentinel and is filtered by the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    /// Request start, monotonic nanoseconds
    pub start_ns: u64,
    /// Request end, monotonic nanoseconds
    pub end_ns: u64,
}

impl Timestamp {
    /// Create a new timestamp pair
    #[must_use]
    pub fn new(start_ns: u64, end_ns: u64) -> Self {
        Self { start_ns, end_ns }
    }

    /// Whether the pair is well formed (start <= end)
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.start_ns <= self.end_ns
    }

    /// Request latency in nanoseconds
    #[must_use]
    pub fn latency_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }
}

/// Buffer and stat cells shared between workers and the sampler
///
/// The sole writer operation is [`StatusReport::record`] (append plus stat
/// copy); the sole reader operations are [`StatusReport::drain`] (atomic
/// swap with an empty buffer) and [`StatusReport::accumulated_stat`].
#[derive(Debug, Default)]
pub struct StatusReport {
    inner: Mutex<ReportInner>,
}

#[derive(Debug, Default)]
struct ReportInner {
    timestamps: Vec<Timestamp>,
    context_stats: Vec<ContextStat>,
}

impl StatusReport {
    /// Create an empty report with no registered workers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new worker and return its stat slot index
    pub fn register_worker(&self) -> usize {
        let mut inner = self.inner.lock().expect("status report mutex poisoned");
        inner.context_stats.push(ContextStat::default());
        inner.context_stats.len() - 1
    }

    /// Append a timestamp and overwrite the worker's stat cell in one
    /// critical section
    pub fn record(&self, slot: usize, timestamp: Timestamp, stat: ContextStat) {
        let mut inner = self.inner.lock().expect("status report mutex poisoned");
        inner.timestamps.push(timestamp);
        inner.context_stats[slot] = stat;
    }

    /// Swap the buffer with an empty one, yielding every timestamp
    /// produced since the previous drain
    #[must_use]
    pub fn drain(&self) -> Vec<Timestamp> {
        let mut inner = self.inner.lock().expect("status report mutex poisoned");
        std::mem::take(&mut inner.timestamps)
    }

    /// Field-wise sum of every worker's current stat cell
    #[must_use]
    pub fn accumulated_stat(&self) -> ContextStat {
        let inner = self.inner.lock().expect("status report mutex poisoned");
        let mut total = ContextStat::default();
        for stat in &inner.context_stats {
            total.completed_request_count += stat.completed_request_count;
            total.cumulative_total_request_time_ns += stat.cumulative_total_request_time_ns;
            total.cumulative_send_time_ns += stat.cumulative_send_time_ns;
            total.cumulative_receive_time_ns += stat.cumulative_receive_time_ns;
        }
        total
    }
}
