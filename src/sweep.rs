//! Sweep driver over concurrency levels
//!
//! Fixed mode measures one operating point. Dynamic mode walks the
//! concurrency up one level at a time until the average latency crosses
//! the configured ceiling, an optional hard cap is exceeded, or a step
//! fails; no backoff, no binary search.

use crate::client::Protocol;
use crate::error::Result;
use crate::manager::ConcurrencyManager;
use crate::report;
use crate::summary::PerfStatus;

/// Configuration for one sweep
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Fixed level, or the starting level in dynamic mode
    pub start_concurrency: usize,
    /// Walk concurrency upward instead of measuring one point
    pub dynamic: bool,
    /// Stop once average latency reaches this many milliseconds
    pub latency_threshold_ms: u64,
    /// Hard cap on concurrency in dynamic mode; 0 means uncapped
    pub max_concurrency: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            start_concurrency: 1,
            dynamic: false,
            latency_threshold_ms: 0,
            max_concurrency: 0,
        }
    }
}

/// Run the configured sweep, printing one report per operating point
///
/// Returns the collected measurements in sweep order; fixed mode returns
/// an empty summary since there is nothing to aggregate.
pub fn run(
    manager: &mut ConcurrencyManager,
    config: &SweepConfig,
    protocol: Protocol,
    verbose: bool,
) -> Result<Vec<PerfStatus>> {
    let mut summary = Vec::new();

    if !config.dynamic {
        let status = manager.step(config.start_concurrency)?;
        report::print_point(&status, protocol, verbose);
        return Ok(summary);
    }

    let mut concurrency = config.start_concurrency;
    while config.max_concurrency == 0 || concurrency <= config.max_concurrency {
        let status = manager.step(concurrency)?;
        report::print_point(&status, protocol, verbose);
        summary.push(status);

        let avg_latency_ms = status.client_avg_latency_ns / 1_000_000;
        if avg_latency_ms >= config.latency_threshold_ms {
            tracing::info!(
                concurrency,
                avg_latency_ms,
                latency_threshold_ms = config.latency_threshold_ms,
                "latency threshold reached"
            );
            break;
        }
        concurrency += 1;
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SweepConfig::default();
        assert_eq!(config.start_concurrency, 1);
        assert!(!config.dynamic);
        assert_eq!(config.max_concurrency, 0);
    }
}
