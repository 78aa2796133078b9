//! Concurrency controller
//!
//! Owns the worker set and the measurement loop. The active concurrency
//! level is exactly the wake gate's pause index: raising it spawns or
//! unparks workers, lowering it parks the trailing ones without destroying
//! them, so level changes cost nothing and per-context statistics survive.
//!
//! One `step` adjusts the level, then measures window after window until
//! the stability rule is satisfied, the sample budget is exhausted, or an
//! exit signal arrives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::client::{ClientFactory, ProfileContext, StatusContext};
use crate::error::{MedirError, Result};
use crate::sampler;
use crate::stability::StabilityDetector;
use crate::status::ModelStatus;
use crate::summary::{self, MeasurementInputs, PerfStatus};
use crate::timestamp::{MonotonicClock, StatusReport};
use crate::worker::{self, WakeGate, Worker, WorkerEnv};

/// Number of trailing windows the stability rule inspects
const RECENT_WINDOW: usize = 3;

/// Configuration for a [`ConcurrencyManager`]
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Ask the server to profile for the duration of each measurement
    pub profile: bool,
    /// Batch size of every request
    pub batch_size: u32,
    /// Fractional stability tolerance (0.10 = ±10%)
    pub stable_offset: f64,
    /// Length of the sampled measurement window
    pub measurement_window: Duration,
    /// Measurement attempts per level before giving up on stability
    pub max_measurement_count: usize,
    /// Use the single pipelining worker instead of one thread per request
    pub async_mode: bool,
    /// Model under measurement
    pub model_name: String,
    /// Requested model version; negative means latest
    pub model_version: i64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            profile: false,
            batch_size: 1,
            stable_offset: 0.1,
            measurement_window: Duration::from_millis(1000),
            max_measurement_count: 10,
            async_mode: false,
            model_name: String::new(),
            model_version: -1,
        }
    }
}

impl ManagerConfig {
    /// Create a configuration for `model_name` with default settings
    #[must_use]
    pub fn new(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            ..Self::default()
        }
    }

    /// Set the batch size
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the requested model version
    #[must_use]
    pub fn with_model_version(mut self, model_version: i64) -> Self {
        self.model_version = model_version;
        self
    }

    /// Set the fractional stability tolerance
    #[must_use]
    pub fn with_stable_offset(mut self, stable_offset: f64) -> Self {
        self.stable_offset = stable_offset;
        self
    }

    /// Set the measurement window length
    #[must_use]
    pub fn with_measurement_window(mut self, window: Duration) -> Self {
        self.measurement_window = window;
        self
    }

    /// Set the measurement budget per concurrency level
    #[must_use]
    pub fn with_max_measurement_count(mut self, count: usize) -> Self {
        self.max_measurement_count = count;
        self
    }

    /// Toggle the asynchronous worker variant
    #[must_use]
    pub fn with_async_mode(mut self, async_mode: bool) -> Self {
        self.async_mode = async_mode;
        self
    }

    /// Toggle server-side profiling around measurements
    #[must_use]
    pub fn with_profile(mut self, profile: bool) -> Self {
        self.profile = profile;
        self
    }
}

/// Maintains a controllable number of in-flight requests and measures
/// stable operating points
pub struct ConcurrencyManager {
    config: ManagerConfig,
    factory: Arc<dyn ClientFactory>,
    clock: Arc<MonotonicClock>,
    report: Arc<StatusReport>,
    gate: Arc<WakeGate>,
    exit: Arc<AtomicBool>,
    workers: Vec<Worker>,
    status_ctx: Box<dyn StatusContext>,
    profile_ctx: Option<Box<dyn ProfileContext>>,
}

impl ConcurrencyManager {
    /// Create a manager; workers are spawned lazily by [`Self::step`]
    pub fn new(config: ManagerConfig, factory: Arc<dyn ClientFactory>) -> Result<Self> {
        let status_ctx = factory.status_context()?;
        let profile_ctx = if config.profile {
            Some(factory.profile_context()?)
        } else {
            None
        };
        Ok(Self {
            config,
            factory,
            clock: Arc::new(MonotonicClock::new()),
            report: Arc::new(StatusReport::new()),
            gate: Arc::new(WakeGate::new()),
            exit: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            status_ctx,
            profile_ctx,
        })
    }

    /// The exit flag observed by every worker and by the step loop
    ///
    /// A signal handler forwards into this handle; raising it lets
    /// in-flight requests finish and makes the current step return
    /// [`MedirError::Interrupted`].
    #[must_use]
    pub fn exit_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exit)
    }

    /// Number of workers spawned so far (never decreases)
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Set the active concurrency to `concurrency` and return one stable
    /// measurement at that level
    ///
    /// Requests keep flowing between measurements, so server-side counts
    /// will cover more requests than the sampled client window.
    pub fn step(&mut self, concurrency: usize) -> Result<PerfStatus> {
        // Adjust the level first so trailing workers park and newly
        // spawned ones start active.
        self.gate.set_pause_index(concurrency);
        if self.config.async_mode {
            // One pipelining worker is sufficient for every level.
            if self.workers.is_empty() {
                let worker = worker::spawn_async(&self.worker_env())?;
                self.workers.push(worker);
            }
        } else {
            while self.workers.len() < concurrency {
                let index = self.workers.len();
                let worker = worker::spawn_sync(&self.worker_env(), index)?;
                self.workers.push(worker);
            }
        }

        tracing::info!(concurrency, "request concurrency");

        let mut detector = StabilityDetector::new(RECENT_WINDOW, self.config.stable_offset);
        let status = loop {
            // A worker that died cannot sustain the requested level; fail
            // the step rather than report a stale metric.
            self.check_worker_health()?;

            let mut status = self.measure()?;
            status.concurrency = u32::try_from(concurrency).unwrap_or(u32::MAX);
            detector.observe(status.client_infer_per_sec, status.client_avg_latency_ns);
            tracing::debug!(
                pass = detector.samples(),
                throughput = status.client_infer_per_sec,
                avg_latency_us = status.client_avg_latency_ns / 1000,
                std_us = status.std_us,
                "measurement pass"
            );

            if detector.is_stable() {
                break status;
            }
            if self.exit.load(Ordering::SeqCst) {
                return Err(MedirError::Interrupted);
            }
            if detector.samples() >= self.config.max_measurement_count {
                tracing::warn!(
                    concurrency,
                    max_measurement_count = self.config.max_measurement_count,
                    "failed to obtain stable measurement, try a larger time window"
                );
                break status;
            }
        };
        if self.exit.load(Ordering::SeqCst) {
            return Err(MedirError::Interrupted);
        }
        Ok(status)
    }

    fn worker_env(&self) -> WorkerEnv {
        WorkerEnv {
            factory: Arc::clone(&self.factory),
            batch_size: self.config.batch_size,
            report: Arc::clone(&self.report),
            gate: Arc::clone(&self.gate),
            exit: Arc::clone(&self.exit),
            clock: Arc::clone(&self.clock),
        }
    }

    fn check_worker_health(&self) -> Result<()> {
        if self.workers.iter().any(|worker| worker.error().is_some()) {
            return Err(MedirError::FailedToMaintainConcurrency);
        }
        Ok(())
    }

    fn model_status(&mut self) -> Result<ModelStatus> {
        let status = self.status_ctx.server_status()?;
        status
            .model_status
            .get(&self.config.model_name)
            .cloned()
            .ok_or_else(|| MedirError::MissingModelStatus {
                model: self.config.model_name.clone(),
            })
    }

    /// One measurement window: snapshot, sleep, snapshot, sample, compose
    fn measure(&mut self) -> Result<PerfStatus> {
        let start_status = self.model_status()?;
        if let Some(profile) = self.profile_ctx.as_mut() {
            profile.start_profile()?;
        }
        let start_stat = self.report.accumulated_stat();

        // 20% slack so the interior window is reliably populated.
        thread::sleep(self.config.measurement_window.mul_f64(1.2));

        let end_stat = self.report.accumulated_stat();
        if let Some(profile) = self.profile_ctx.as_mut() {
            profile.stop_profile()?;
        }
        let end_status = self.model_status()?;

        let snapshot = self.report.drain();
        let window_ns =
            u64::try_from(self.config.measurement_window.as_nanos()).unwrap_or(u64::MAX);
        let window = sampler::measure_window(&snapshot, window_ns, self.config.batch_size)?;

        summary::compose(&MeasurementInputs {
            batch_size: self.config.batch_size,
            model_name: &self.config.model_name,
            model_version: self.config.model_version,
            window: &window,
            start_stat: &start_stat,
            end_stat: &end_stat,
            start_status: &start_status,
            end_status: &end_status,
        })
    }
}

impl Drop for ConcurrencyManager {
    fn drop(&mut self) {
        self.exit.store(true, Ordering::SeqCst);
        // Unpark everyone; the raised exit flag satisfies the wake
        // predicate regardless of the index.
        self.gate.set_pause_index(self.workers.len().max(1));
        for (index, worker) in self.workers.iter_mut().enumerate() {
            if let Some(err) = worker.join() {
                tracing::error!(worker = index, %err, "worker finished with error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.batch_size, 1);
        assert!((config.stable_offset - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.max_measurement_count, 10);
        assert_eq!(config.model_version, -1);
        assert!(!config.async_mode);
    }

    #[test]
    fn test_config_builders() {
        let config = ManagerConfig::new("resnet50")
            .with_batch_size(4)
            .with_model_version(2)
            .with_stable_offset(0.05)
            .with_measurement_window(Duration::from_millis(250))
            .with_max_measurement_count(5)
            .with_async_mode(true)
            .with_profile(true);
        assert_eq!(config.model_name, "resnet50");
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.model_version, 2);
        assert_eq!(config.measurement_window, Duration::from_millis(250));
        assert_eq!(config.max_measurement_count, 5);
        assert!(config.async_mode);
        assert!(config.profile);
    }
}
