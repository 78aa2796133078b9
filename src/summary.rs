//! Measurement summary composition
//!
//! Combines per-window client statistics, per-context transport
//! accumulators and server-side counter snapshots into one [`PerfStatus`].
//! Server and client request counts are expected to diverge: the server
//! counts everything it processed during the measurement sleep, the client
//! only what completed inside the sampled window. Both are reported.

use serde::Serialize;

use crate::client::ContextStat;
use crate::error::{MedirError, Result};
use crate::sampler::WindowStats;
use crate::status::ModelStatus;

/// One complete measurement at an operating point
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PerfStatus {
    /// Concurrent request count this measurement was taken at
    pub concurrency: u32,
    /// Batch size of each request
    pub batch_size: u32,
    /// Requests the server completed during the measurement sleep
    pub server_request_count: u64,
    /// Server-side total request time delta
    pub server_cumm_time_ns: u64,
    /// Server-side queue time delta
    pub server_queue_time_ns: u64,
    /// Server-side compute time delta
    pub server_compute_time_ns: u64,
    /// Requests completing inside the client window
    pub client_request_count: u64,
    /// Client window length
    pub client_duration_ns: u64,
    /// Minimum request latency in the window
    pub client_min_latency_ns: u64,
    /// Maximum request latency in the window
    pub client_max_latency_ns: u64,
    /// Mean request latency in the window
    pub client_avg_latency_ns: u64,
    /// Latency standard deviation, microseconds
    pub std_us: u64,
    /// Mean transport round-trip time per completed request
    pub client_avg_request_time_ns: u64,
    /// Mean marshal/send time per completed request
    pub client_avg_send_time_ns: u64,
    /// Mean unmarshal/receive time per completed request
    pub client_avg_receive_time_ns: u64,
    /// Inferences per second observed by the client
    pub client_infer_per_sec: u64,
}

/// Everything the composer needs for one measurement
#[derive(Debug, Clone, Copy)]
pub struct MeasurementInputs<'a> {
    /// Batch size of each request
    pub batch_size: u32,
    /// Model under measurement
    pub model_name: &'a str,
    /// Requested model version; negative resolves to the latest present
    pub model_version: i64,
    /// Client-side window statistics
    pub window: &'a WindowStats,
    /// Accumulated context stats before the measurement sleep
    pub start_stat: &'a ContextStat,
    /// Accumulated context stats after the measurement sleep
    pub end_stat: &'a ContextStat,
    /// Server snapshot before the measurement sleep
    pub start_status: &'a ModelStatus,
    /// Server snapshot after the measurement sleep
    pub end_status: &'a ModelStatus,
}

/// Difference two monotonic counter readings, failing on regression
fn delta(end: u64, start: u64, counter: &str) -> Result<u64> {
    end.checked_sub(start)
        .ok_or_else(|| MedirError::CounterRegression {
            counter: counter.to_string(),
        })
}

/// Compose one [`PerfStatus`] from a measurement's raw pieces
///
/// The start server snapshot may lack an entry for the resolved version
/// and batch size (first window after model load); it is treated as zero.
/// The end snapshot must carry one.
pub fn compose(inputs: &MeasurementInputs<'_>) -> Result<PerfStatus> {
    let window = inputs.window;
    let mut summary = PerfStatus {
        batch_size: inputs.batch_size,
        client_request_count: window.request_count,
        client_duration_ns: window.duration_ns,
        client_min_latency_ns: window.min_latency_ns,
        client_max_latency_ns: window.max_latency_ns,
        client_avg_latency_ns: window.avg_latency_ns,
        std_us: window.std_us,
        client_infer_per_sec: window.infer_per_sec,
        ..PerfStatus::default()
    };

    // Transport accumulators across the sleep; a zero completed-count
    // delta leaves the averages at zero rather than dividing.
    let completed = delta(
        inputs.end_stat.completed_request_count,
        inputs.start_stat.completed_request_count,
        "completed_request_count",
    )?;
    let request_time_ns = delta(
        inputs.end_stat.cumulative_total_request_time_ns,
        inputs.start_stat.cumulative_total_request_time_ns,
        "cumulative_total_request_time_ns",
    )?;
    let send_time_ns = delta(
        inputs.end_stat.cumulative_send_time_ns,
        inputs.start_stat.cumulative_send_time_ns,
        "cumulative_send_time_ns",
    )?;
    let receive_time_ns = delta(
        inputs.end_stat.cumulative_receive_time_ns,
        inputs.start_stat.cumulative_receive_time_ns,
        "cumulative_receive_time_ns",
    )?;
    if completed != 0 {
        summary.client_avg_request_time_ns = request_time_ns / completed;
        summary.client_avg_send_time_ns = send_time_ns / completed;
        summary.client_avg_receive_time_ns = receive_time_ns / completed;
    }

    // Resolve a negative version to the latest one the server reports.
    let version = if inputs.model_version < 0 {
        inputs
            .end_status
            .latest_version()
            .ok_or(MedirError::MissingVersionStatus {
                model: inputs.model_name.to_string(),
                version: inputs.model_version,
            })?
    } else {
        inputs.model_version
    };

    let end_version =
        inputs
            .end_status
            .version_status
            .get(&version)
            .ok_or(MedirError::MissingVersionStatus {
                model: inputs.model_name.to_string(),
                version,
            })?;
    let end_stats = end_version.infer_stats.get(&inputs.batch_size).ok_or(
        MedirError::MissingInferStats {
            model: inputs.model_name.to_string(),
            version,
            batch_size: inputs.batch_size,
        },
    )?;
    let start_stats = inputs
        .start_status
        .version_status
        .get(&version)
        .and_then(|status| status.infer_stats.get(&inputs.batch_size))
        .copied()
        .unwrap_or_default();

    summary.server_request_count = delta(
        end_stats.success.count,
        start_stats.success.count,
        "success.count",
    )?;
    summary.server_cumm_time_ns = delta(
        end_stats.success.total_time_ns,
        start_stats.success.total_time_ns,
        "success.total_time_ns",
    )?;
    summary.server_queue_time_ns = delta(
        end_stats.queue.total_time_ns,
        start_stats.queue.total_time_ns,
        "queue.total_time_ns",
    )?;
    summary.server_compute_time_ns = delta(
        end_stats.compute.total_time_ns,
        start_stats.compute.total_time_ns,
        "compute.total_time_ns",
    )?;

    Ok(summary)
}
