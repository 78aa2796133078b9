//! Report emission
//!
//! Human-readable per-point blocks, the sweep summary, and the CSV
//! export. The human block decomposes the client-library round trip by
//! transport and the server latency into overhead, queue and compute;
//! the CSV is sorted by ascending throughput.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::client::Protocol;
use crate::error::{MedirError, Result};
use crate::summary::PerfStatus;

/// Header row of the CSV export
pub const CSV_HEADER: &str = "Concurrency,Inferences/Second,Client Send,Network+Server Send/Recv,Server Queue,Server Compute,Client Recv";

fn io_err(err: &std::io::Error) -> MedirError {
    MedirError::Io {
        reason: err.to_string(),
    }
}

fn div_or_zero(numerator: u64, denominator: u64) -> u64 {
    if denominator == 0 {
        0
    } else {
        numerator / denominator
    }
}

/// Print the two-part Client/Server block for one operating point
pub fn print_point(status: &PerfStatus, protocol: Protocol, verbose: bool) {
    let count = status.server_request_count;
    let cumm_avg_us = div_or_zero(status.server_cumm_time_ns / 1000, count);
    let queue_avg_us = div_or_zero(status.server_queue_time_ns / 1000, count);
    let compute_avg_us = div_or_zero(status.server_compute_time_ns / 1000, count);
    let overhead_us = cumm_avg_us.saturating_sub(queue_avg_us + compute_avg_us);

    let avg_latency_us = status.client_avg_latency_ns / 1000;
    let avg_request_us = status.client_avg_request_time_ns / 1000;
    let avg_send_us = status.client_avg_send_time_ns / 1000;
    let avg_receive_us = status.client_avg_receive_time_ns / 1000;
    let response_wait_us = avg_request_us.saturating_sub(avg_send_us + avg_receive_us);

    let transport_detail = match protocol {
        Protocol::Grpc => {
            if verbose {
                format!(
                    "Avg gRPC time: {avg_request_us} usec (marshal {avg_send_us} usec + response wait {response_wait_us} usec + unmarshal {avg_receive_us} usec)"
                )
            } else {
                format!(
                    "Avg gRPC time: {avg_request_us} usec ((un)marshal request/response {} usec + response wait {response_wait_us} usec)",
                    avg_send_us + avg_receive_us
                )
            }
        }
        Protocol::Http => {
            if verbose {
                format!(
                    "Avg HTTP time: {avg_request_us} usec (send {avg_send_us} usec + response wait {response_wait_us} usec + receive {avg_receive_us} usec)"
                )
            } else {
                format!(
                    "Avg HTTP time: {avg_request_us} usec (send/recv {} usec + response wait {response_wait_us} usec)",
                    avg_send_us + avg_receive_us
                )
            }
        }
    };

    println!("  Client:");
    println!("    Request count: {}", status.client_request_count);
    println!("    Throughput: {} infer/sec", status.client_infer_per_sec);
    println!(
        "    Avg latency: {avg_latency_us} usec (standard deviation {} usec)",
        status.std_us
    );
    println!("    {transport_detail}");
    println!("  Server:");
    println!("    Request count: {count}");
    println!(
        "    Avg request latency: {cumm_avg_us} usec (overhead {overhead_us} usec + queue {queue_avg_us} usec + compute {compute_avg_us} usec)"
    );
    println!();
}

/// Print the throughput/latency summary lines in sweep order
pub fn print_summary(summary: &[PerfStatus]) {
    println!("Inferences/Second vs. Client Average Batch Latency");
    for status in summary {
        println!(
            "Concurrency: {}, {} infer/sec, latency {} usec",
            status.concurrency,
            status.client_infer_per_sec,
            status.client_avg_latency_ns / 1000
        );
    }
}

/// Write the sweep summary to `path` as CSV
///
/// Rows are sorted by ascending Inferences/Second; all times are
/// microseconds. The network column is the client latency left over after
/// server queue/compute and client send/receive are accounted for.
pub fn write_csv(path: &Path, summary: &[PerfStatus]) -> Result<()> {
    let mut rows: Vec<PerfStatus> = summary.to_vec();
    rows.sort_by_key(|status| status.client_infer_per_sec);

    let file = File::create(path).map_err(|e| io_err(&e))?;
    let mut out = BufWriter::new(file);
    writeln!(out, "{CSV_HEADER}").map_err(|e| io_err(&e))?;

    for status in &rows {
        let avg_queue_ns = div_or_zero(status.server_queue_time_ns, status.server_request_count);
        let avg_compute_ns =
            div_or_zero(status.server_compute_time_ns, status.server_request_count);
        let network_ns = status.client_avg_latency_ns.saturating_sub(
            avg_queue_ns
                + avg_compute_ns
                + status.client_avg_send_time_ns
                + status.client_avg_receive_time_ns,
        );
        writeln!(
            out,
            "{},{},{},{},{},{},{}",
            status.concurrency,
            status.client_infer_per_sec,
            status.client_avg_send_time_ns / 1000,
            network_ns / 1000,
            avg_queue_ns / 1000,
            avg_compute_ns / 1000,
            status.client_avg_receive_time_ns / 1000
        )
        .map_err(|e| io_err(&e))?;
    }
    out.flush().map_err(|e| io_err(&e))
}
