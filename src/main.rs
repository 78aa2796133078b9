//! Medir CLI - performance measurement driver for inference servers
//!
//! Measure throughput and latency at a fixed concurrency, or sweep
//! concurrency upward until a latency ceiling is crossed.

use std::path::PathBuf;
use std::process;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use medir::client::{Protocol, ProtocolFactory};
use medir::error::{MedirError, Result};
use medir::manager::{ConcurrencyManager, ManagerConfig};
use medir::sweep::SweepConfig;
use medir::{report, sweep};

/// Medir - performance measurement driver for inference servers
#[derive(Parser)]
#[command(name = "medir")]
#[command(version, about, long_about = None)]
struct Args {
    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable server-side profiling for the duration of the run
    #[arg(short = 'n', long)]
    profile: bool,

    /// Batch size for each request
    #[arg(short, long, default_value_t = 1)]
    batch_size: u32,

    /// Concurrent request count; the starting level in dynamic mode
    #[arg(short = 't', long, default_value_t = 1)]
    concurrency: usize,

    /// Increase concurrency linearly until latency crosses the threshold
    #[arg(short, long)]
    dynamic: bool,

    /// Maintain concurrency with asynchronous requests on one worker
    #[arg(short = 'a', long = "async")]
    async_mode: bool,

    /// Latency threshold in msec; no effect unless --dynamic is set
    #[arg(short = 'l', long, default_value_t = 0)]
    latency_threshold: u64,

    /// Maximum concurrency in dynamic mode; 0 means no limit
    #[arg(short = 'c', long, default_value_t = 0)]
    max_concurrency: usize,

    /// Deviation threshold for stable measurement, in percent
    #[arg(short = 's', long, default_value_t = 10.0)]
    stability_threshold: f64,

    /// Measurement window in msec
    #[arg(short = 'p', long, default_value_t = 5000)]
    measurement_window: u64,

    /// Maximum number of measurements per concurrency level
    #[arg(short = 'r', long, default_value_t = 10)]
    max_measurements: usize,

    /// Model name
    #[arg(short = 'm', long, default_value = "")]
    model_name: String,

    /// Model version; negative selects the latest available version
    #[arg(short = 'x', long, default_value_t = -1, allow_negative_numbers = true)]
    model_version: i64,

    /// URL of the inference service
    #[arg(short = 'u', long, default_value = "localhost:8000")]
    url: String,

    /// Protocol used to reach the service: HTTP or gRPC, case-insensitive
    #[arg(short = 'i', long, default_value = "http")]
    protocol: String,

    /// Write the dynamic-mode report to this file as CSV
    #[arg(short = 'f', long)]
    csv: Option<PathBuf>,
}

fn validate(args: &Args) -> Result<()> {
    if args.model_name.is_empty() {
        return Err(MedirError::InvalidArgument {
            reason: "model name must not be empty".to_string(),
        });
    }
    if args.batch_size == 0 {
        return Err(MedirError::InvalidArgument {
            reason: "batch size must be > 0".to_string(),
        });
    }
    if args.measurement_window == 0 {
        return Err(MedirError::InvalidArgument {
            reason: "measurement window must be > 0 in msec".to_string(),
        });
    }
    if args.concurrency == 0 {
        return Err(MedirError::InvalidArgument {
            reason: "concurrent request count must be > 0".to_string(),
        });
    }
    Ok(())
}

fn run(args: &Args) -> Result<()> {
    validate(args)?;
    let protocol =
        Protocol::parse(&args.protocol).ok_or_else(|| MedirError::InvalidArgument {
            reason: format!(
                "unexpected protocol type \"{}\", expecting HTTP or gRPC",
                args.protocol
            ),
        })?;

    let config = ManagerConfig::new(&args.model_name)
        .with_batch_size(args.batch_size)
        .with_model_version(args.model_version)
        .with_stable_offset(args.stability_threshold / 100.0)
        .with_measurement_window(Duration::from_millis(args.measurement_window))
        .with_max_measurement_count(args.max_measurements)
        .with_async_mode(args.async_mode)
        .with_profile(args.profile);
    let factory = Arc::new(ProtocolFactory::new(
        protocol,
        &args.url,
        &args.model_name,
        args.model_version,
    ));
    let mut manager = ConcurrencyManager::new(config, factory)?;

    // The handler only forwards into the manager's exit handle; workers
    // finish their in-flight request and the step returns an error.
    let exit = manager.exit_handle();
    ctrlc::set_handler(move || {
        eprintln!("Interrupt signal received, waiting for in-flight inferences to complete.");
        exit.store(true, Ordering::SeqCst);
    })
    .map_err(|e| MedirError::Io {
        reason: e.to_string(),
    })?;

    println!("*** Measurement Settings ***");
    println!("  Batch size: {}", args.batch_size);
    println!("  Measurement window: {} msec", args.measurement_window);
    if args.dynamic {
        println!("  Latency limit: {} msec", args.latency_threshold);
        if args.max_concurrency != 0 {
            println!(
                "  Concurrency limit: {} concurrent requests",
                args.max_concurrency
            );
        }
    }
    println!();

    let sweep_config = SweepConfig {
        start_concurrency: args.concurrency,
        dynamic: args.dynamic,
        latency_threshold_ms: args.latency_threshold,
        max_concurrency: args.max_concurrency,
    };
    let summary = sweep::run(&mut manager, &sweep_config, protocol, args.verbose)?;

    if !summary.is_empty() {
        report::print_summary(&summary);
        if let Some(path) = &args.csv {
            report::write_csv(path, &summary)?;
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if args.verbose { "medir=debug" } else { "medir=info" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(err) = run(&args) {
        eprintln!("error: {err}");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let args = Args::parse_from(["medir"]);
        assert_eq!(args.model_name, "");
        assert_eq!(args.batch_size, 1);
        assert_eq!(args.concurrency, 1);
        assert_eq!(args.measurement_window, 5000);
        assert_eq!(args.max_measurements, 10);
        assert_eq!(args.model_version, -1);
        assert_eq!(args.url, "localhost:8000");
        assert_eq!(args.protocol, "http");
        assert!(!args.dynamic);
        assert!(!args.async_mode);
        assert!(args.csv.is_none());
    }

    #[test]
    fn test_cli_flag_overrides() {
        let args = Args::parse_from([
            "medir", "-m", "resnet50", "-b", "4", "-t", "2", "-d", "-a", "-l", "100", "-c",
            "8", "-s", "5", "-p", "500", "-r", "3", "-x", "2", "-i", "gRPC", "-f",
            "report.csv",
        ]);
        assert_eq!(args.model_name, "resnet50");
        assert_eq!(args.batch_size, 4);
        assert_eq!(args.concurrency, 2);
        assert!(args.dynamic);
        assert!(args.async_mode);
        assert_eq!(args.latency_threshold, 100);
        assert_eq!(args.max_concurrency, 8);
        assert!((args.stability_threshold - 5.0).abs() < f64::EPSILON);
        assert_eq!(args.measurement_window, 500);
        assert_eq!(args.max_measurements, 3);
        assert_eq!(args.model_version, 2);
        assert_eq!(args.protocol, "gRPC");
        assert_eq!(args.csv, Some(std::path::PathBuf::from("report.csv")));
    }

    #[test]
    fn test_cli_negative_model_version() {
        let args = Args::parse_from(["medir", "-m", "m", "-x", "-1"]);
        assert_eq!(args.model_version, -1);
    }

    #[test]
    fn test_validate_accepts_good_args() {
        let args = Args::parse_from(["medir", "-m", "resnet50"]);
        assert!(validate(&args).is_ok());
    }

    #[test]
    fn test_missing_model_name_fails_validation() {
        let args = Args::parse_from(["medir"]);
        let err = validate(&args).expect_err("empty model name");
        assert!(matches!(err, MedirError::InvalidArgument { .. }));
        assert!(err.to_string().contains("model name"));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let args = Args::parse_from(["medir", "-m", "m", "-b", "0"]);
        let err = validate(&args).expect_err("zero batch size");
        assert!(err.to_string().contains("batch size"));
    }

    #[test]
    fn test_zero_measurement_window_rejected() {
        let args = Args::parse_from(["medir", "-m", "m", "-p", "0"]);
        let err = validate(&args).expect_err("zero window");
        assert!(err.to_string().contains("measurement window"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let args = Args::parse_from(["medir", "-m", "m", "-t", "0"]);
        let err = validate(&args).expect_err("zero concurrency");
        assert!(err.to_string().contains("concurrent request count"));
    }

    #[test]
    fn test_unknown_protocol_fails_run() {
        // Rejected before any context is created, so no server is needed.
        let args = Args::parse_from(["medir", "-m", "m", "-i", "quic"]);
        let err = run(&args).expect_err("unknown protocol");
        assert!(matches!(err, MedirError::InvalidArgument { .. }));
        assert!(err.to_string().contains("protocol"));
    }
}
