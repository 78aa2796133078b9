//! Measurement-window sampling
//!
//! Extracts a window of length W from the interior of a drained timestamp
//! snapshot so ramp-up and drain transients do not contaminate the
//! measurement, then computes the per-window client-side statistics.
//!
//! Requests are counted by completion time: a request whose start predates
//! the window but whose completion falls inside it is counted in full,
//! which keeps long-latency requests that straddle the boundary from being
//! systematically under-reported.

#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

use crate::error::{MedirError, Result};
use crate::timestamp::Timestamp;

/// Client-side statistics over one measurement window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowStats {
    /// Requests whose completion fell inside the window
    pub request_count: u64,
    /// Window length in nanoseconds
    pub duration_ns: u64,
    /// Minimum request latency
    pub min_latency_ns: u64,
    /// Maximum request latency
    pub max_latency_ns: u64,
    /// Mean request latency
    pub avg_latency_ns: u64,
    /// Latency standard deviation, microseconds
    pub std_us: u64,
    /// Inferences per second: `request_count × batch_size / window`
    pub infer_per_sec: u64,
}

/// Compute window statistics over a drained snapshot
///
/// Fails with [`MedirError::NoValidRequests`] when no valid timestamp
/// completes inside the window.
pub fn measure_window(
    snapshot: &[Timestamp],
    window_ns: u64,
    batch_size: u32,
) -> Result<WindowStats> {
    let mut first_start_ns = u64::MAX;
    let mut last_end_ns = 0_u64;
    for ts in snapshot.iter().filter(|ts| ts.is_valid()) {
        first_start_ns = first_start_ns.min(ts.start_ns);
        last_end_ns = last_end_ns.max(ts.end_ns);
    }
    if first_start_ns == u64::MAX {
        return Err(MedirError::NoValidRequests);
    }

    // Center the window inside [first start, last end].
    let span_end = first_start_ns.saturating_add(window_ns);
    let offset = if span_end > last_end_ns {
        0
    } else {
        (last_end_ns - span_end) / 2
    };
    let client_start_ns = first_start_ns + offset;
    let client_end_ns = client_start_ns + window_ns;

    let mut request_count = 0_u64;
    let mut min_latency_ns = u64::MAX;
    let mut max_latency_ns = 0_u64;
    let mut total_latency_ns = 0_u64;
    // Squares accumulate in microseconds to stay inside 64 bits.
    let mut total_square_us = 0_u64;
    for ts in snapshot {
        if !ts.is_valid() {
            continue;
        }
        if ts.end_ns < client_start_ns || ts.end_ns > client_end_ns {
            continue;
        }
        let latency_ns = ts.latency_ns();
        min_latency_ns = min_latency_ns.min(latency_ns);
        max_latency_ns = max_latency_ns.max(latency_ns);
        total_latency_ns += latency_ns;
        total_square_us = total_square_us.saturating_add(squared_us(latency_ns));
        request_count += 1;
    }
    if request_count == 0 {
        return Err(MedirError::NoValidRequests);
    }

    let avg_latency_ns = total_latency_ns / request_count;
    let expected_square_us = total_square_us / request_count;
    let square_avg_us = squared_us(avg_latency_ns);
    let variance_us = expected_square_us.saturating_sub(square_avg_us);
    let std_us = (variance_us as f64).sqrt() as u64;

    let duration_ns = client_end_ns - client_start_ns;
    let duration_sec = duration_ns as f64 / 1e9;
    let infer_per_sec = ((request_count * u64::from(batch_size)) as f64 / duration_sec) as u64;

    Ok(WindowStats {
        request_count,
        duration_ns,
        min_latency_ns,
        max_latency_ns,
        avg_latency_ns,
        std_us,
        infer_per_sec,
    })
}

/// `latency_ns² / 1e6`, computed wide to avoid intermediate overflow
fn squared_us(latency_ns: u64) -> u64 {
    let wide = u128::from(latency_ns) * u128::from(latency_ns) / 1_000_000;
    u64::try_from(wide).unwrap_or(u64::MAX)
}
