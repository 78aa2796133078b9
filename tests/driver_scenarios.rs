//! End-to-end driver scenarios over synthetic inference contexts
//!
//! A `ServerModel` stands in for the inference server: it tracks in-flight
//! requests, serves a configurable latency curve, and keeps the same
//! monotonic counters the status endpoint would report. Contexts are
//! injected through `ClientFactory`, so every scenario exercises the real
//! worker/manager/sampler/summary pipeline.
//!
//! Timing assertions use generous tolerances; the scenarios sleep real
//! wall time and run serially.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serial_test::serial;

use medir::client::{
    ClientFactory, ContextStat, InferContext, InferInput, ProfileContext, Protocol, RunOptions,
    StatusContext,
};
use medir::error::{MedirError, Result};
use medir::manager::{ConcurrencyManager, ManagerConfig};
use medir::status::{InferStats, ModelStatus, ModelVersionStatus, ServerStatus, StatDuration};
use medir::sweep::{self, SweepConfig};
use medir::{report, PerfStatus};

const MODEL: &str = "testmodel";
const VERSION: i64 = 1;

// ============================================================================
// Synthetic server
// ============================================================================

/// Latency curve served by the synthetic server
#[derive(Debug, Clone, Copy)]
enum LatencyModel {
    /// Every request takes exactly this long
    Fixed(Duration),
    /// `base + slope × (in_flight - 1)`: latency grows with load
    PerInFlight { base: Duration, slope: Duration },
}

/// Stand-in for the inference server shared by every mock context
struct ServerModel {
    batch_size: u32,
    latency: LatencyModel,
    in_flight: AtomicU64,
    max_in_flight: AtomicU64,
    completed: AtomicU64,
    cumm_time_ns: AtomicU64,
    queue_time_ns: AtomicU64,
    compute_time_ns: AtomicU64,
}

impl ServerModel {
    fn new(latency: LatencyModel, batch_size: u32) -> Arc<Self> {
        Arc::new(Self {
            batch_size,
            latency,
            in_flight: AtomicU64::new(0),
            max_in_flight: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            cumm_time_ns: AtomicU64::new(0),
            queue_time_ns: AtomicU64::new(0),
            compute_time_ns: AtomicU64::new(0),
        })
    }

    /// Admit one request and return how long it will take
    fn begin(&self) -> Duration {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        match self.latency {
            LatencyModel::Fixed(latency) => latency,
            LatencyModel::PerInFlight { base, slope } => {
                base + slope * u32::try_from(in_flight.saturating_sub(1)).unwrap_or(u32::MAX)
            }
        }
    }

    /// Complete one request, accumulating the server-side counters
    fn finish(&self, latency: Duration) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        let ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.cumm_time_ns.fetch_add(ns, Ordering::SeqCst);
        self.queue_time_ns.fetch_add(ns / 4, Ordering::SeqCst);
        self.compute_time_ns.fetch_add(ns / 2, Ordering::SeqCst);
    }

    /// The status snapshot the server would report right now
    fn snapshot(&self) -> ServerStatus {
        let completed = self.completed.load(Ordering::SeqCst);
        let stats = InferStats {
            success: StatDuration {
                count: completed,
                total_time_ns: self.cumm_time_ns.load(Ordering::SeqCst),
            },
            queue: StatDuration {
                count: completed,
                total_time_ns: self.queue_time_ns.load(Ordering::SeqCst),
            },
            compute: StatDuration {
                count: completed,
                total_time_ns: self.compute_time_ns.load(Ordering::SeqCst),
            },
        };
        let mut version = ModelVersionStatus::default();
        version.infer_stats.insert(self.batch_size, stats);
        let mut model = ModelStatus::default();
        model.version_status.insert(VERSION, version);
        let mut status = ServerStatus::default();
        status.model_status.insert(MODEL.to_string(), model);
        status
    }
}

// ============================================================================
// Mock contexts and factory
// ============================================================================

struct MockInferContext {
    server: Arc<ServerModel>,
    max_batch_size: u32,
    inputs: Vec<InferInput>,
    outputs: Vec<String>,
    options: Option<RunOptions>,
    stat: ContextStat,
    next_id: u64,
    done_tx: Sender<(u64, Duration)>,
    done_rx: Receiver<(u64, Duration)>,
    ready: HashMap<u64, Duration>,
}

impl MockInferContext {
    fn apply(&mut self, latency: Duration) {
        self.stat.completed_request_count += 1;
        self.stat.cumulative_total_request_time_ns +=
            u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.stat.cumulative_send_time_ns += 20_000;
        self.stat.cumulative_receive_time_ns += 10_000;
    }
}

impl InferContext for MockInferContext {
    fn model_name(&self) -> &str {
        MODEL
    }

    fn max_batch_size(&self) -> u32 {
        self.max_batch_size
    }

    fn inputs(&self) -> &[InferInput] {
        &self.inputs
    }

    fn inputs_mut(&mut self) -> &mut [InferInput] {
        &mut self.inputs
    }

    fn outputs(&self) -> &[String] {
        &self.outputs
    }

    fn set_run_options(&mut self, options: &RunOptions) -> Result<()> {
        self.options = Some(options.clone());
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        if self.options.is_none() {
            return Err(MedirError::Http {
                reason: "run options not set".to_string(),
            });
        }
        let latency = self.server.begin();
        thread::sleep(latency);
        self.server.finish(latency);
        self.apply(latency);
        Ok(())
    }

    fn async_run(&mut self) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        let latency = self.server.begin();
        let server = Arc::clone(&self.server);
        let tx = self.done_tx.clone();
        thread::spawn(move || {
            thread::sleep(latency);
            server.finish(latency);
            let _ = tx.send((id, latency));
        });
        Ok(id)
    }

    fn get_ready_async_request(&mut self, blocking: bool) -> Result<Option<u64>> {
        let (id, latency) = if blocking {
            self.done_rx.recv().map_err(|_| MedirError::Http {
                reason: "mock completion channel closed".to_string(),
            })?
        } else {
            match self.done_rx.try_recv() {
                Ok(done) => done,
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => {
                    return Err(MedirError::Http {
                        reason: "mock completion channel closed".to_string(),
                    })
                }
            }
        };
        self.ready.insert(id, latency);
        Ok(Some(id))
    }

    fn get_async_run_results(&mut self, request_id: u64) -> Result<()> {
        let latency = self
            .ready
            .remove(&request_id)
            .ok_or(MedirError::UnknownAsyncRequest { id: request_id })?;
        self.apply(latency);
        Ok(())
    }

    fn stat(&self) -> ContextStat {
        self.stat
    }
}

struct MockStatusContext {
    server: Arc<ServerModel>,
}

impl StatusContext for MockStatusContext {
    fn server_status(&mut self) -> Result<ServerStatus> {
        Ok(self.server.snapshot())
    }
}

struct MockProfileContext {
    starts: Arc<AtomicU64>,
    stops: Arc<AtomicU64>,
}

impl ProfileContext for MockProfileContext {
    fn start_profile(&mut self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop_profile(&mut self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockFactory {
    server: Arc<ServerModel>,
    max_batch_size: u32,
    contexts_created: AtomicU64,
    profile_starts: Arc<AtomicU64>,
    profile_stops: Arc<AtomicU64>,
}

impl MockFactory {
    fn new(server: &Arc<ServerModel>, max_batch_size: u32) -> Arc<Self> {
        Arc::new(Self {
            server: Arc::clone(server),
            max_batch_size,
            contexts_created: AtomicU64::new(0),
            profile_starts: Arc::new(AtomicU64::new(0)),
            profile_stops: Arc::new(AtomicU64::new(0)),
        })
    }
}

impl ClientFactory for MockFactory {
    fn infer_context(&self) -> Result<Box<dyn InferContext>> {
        self.contexts_created.fetch_add(1, Ordering::SeqCst);
        let (done_tx, done_rx) = mpsc::channel();
        Ok(Box::new(MockInferContext {
            server: Arc::clone(&self.server),
            max_batch_size: self.max_batch_size,
            inputs: vec![InferInput::new("input0", 16)],
            outputs: vec!["output0".to_string()],
            options: None,
            stat: ContextStat::default(),
            next_id: 0,
            done_tx,
            done_rx,
            ready: HashMap::new(),
        }))
    }

    fn status_context(&self) -> Result<Box<dyn StatusContext>> {
        Ok(Box::new(MockStatusContext {
            server: Arc::clone(&self.server),
        }))
    }

    fn profile_context(&self) -> Result<Box<dyn ProfileContext>> {
        Ok(Box::new(MockProfileContext {
            starts: Arc::clone(&self.profile_starts),
            stops: Arc::clone(&self.profile_stops),
        }))
    }
}

fn base_config(batch_size: u32, window: Duration) -> ManagerConfig {
    ManagerConfig::new(MODEL)
        .with_model_version(VERSION)
        .with_batch_size(batch_size)
        .with_measurement_window(window)
        .with_stable_offset(0.10)
        .with_max_measurement_count(10)
}

fn avg_latency_ms(status: &PerfStatus) -> u64 {
    status.client_avg_latency_ns / 1_000_000
}

// ============================================================================
// S1 - fixed mode, synchronous workers, stable point
// ============================================================================

#[test]
#[serial]
fn test_fixed_sync_stable_point() {
    let server = ServerModel::new(LatencyModel::Fixed(Duration::from_millis(50)), 4);
    let factory = MockFactory::new(&server, 8);
    // Version -1 exercises latest-version resolution end to end.
    let config = base_config(4, Duration::from_millis(500)).with_model_version(-1);
    let mut manager =
        ConcurrencyManager::new(config, factory as Arc<dyn ClientFactory>).expect("manager");

    let started = Instant::now();
    let status = manager.step(2).expect("step");
    let elapsed = started.elapsed();

    assert_eq!(status.concurrency, 2);
    assert_eq!(status.batch_size, 4);
    // Two workers at ~50 ms per request: ~40 req/s × batch 4 = ~160.
    assert!(
        (130..=190).contains(&status.client_infer_per_sec),
        "throughput {} outside expected band",
        status.client_infer_per_sec
    );
    assert!(
        (45..=60).contains(&avg_latency_ms(&status)),
        "latency {} ms outside expected band",
        avg_latency_ms(&status)
    );
    assert!(status.client_min_latency_ns <= status.client_avg_latency_ns);
    assert!(status.client_avg_latency_ns <= status.client_max_latency_ns);
    // The server counts everything processed during the (longer) sleep.
    assert!(status.server_request_count >= status.client_request_count);
    assert_eq!(server.max_in_flight.load(Ordering::SeqCst), 2);
    // Constant latency settles immediately: three windows plus overhead.
    assert!(
        elapsed < Duration::from_millis(3500),
        "stability took {elapsed:?}, expected ~3 windows"
    );
}

// ============================================================================
// S2 - dynamic sweep terminates on the latency ceiling
// ============================================================================

#[test]
#[serial]
fn test_dynamic_sweep_stops_at_latency_threshold() {
    let server = ServerModel::new(
        LatencyModel::PerInFlight {
            base: Duration::from_millis(20),
            slope: Duration::from_millis(15),
        },
        1,
    );
    let factory = MockFactory::new(&server, 8);
    let config = base_config(1, Duration::from_millis(200));
    let mut manager =
        ConcurrencyManager::new(config, factory as Arc<dyn ClientFactory>).expect("manager");

    let sweep_config = SweepConfig {
        start_concurrency: 1,
        dynamic: true,
        latency_threshold_ms: 100,
        max_concurrency: 0,
    };
    let summary =
        sweep::run(&mut manager, &sweep_config, Protocol::Http, false).expect("sweep");

    // Latency crosses 100 ms at concurrency 7 (20 + 15 × 6 = 110 ms).
    assert_eq!(summary.len(), 7);
    assert_eq!(summary.last().expect("entries").concurrency, 7);
    assert!(avg_latency_ms(summary.last().expect("entries")) >= 100);
    for (index, status) in summary.iter().enumerate() {
        assert_eq!(status.concurrency, u32::try_from(index).expect("fits") + 1);
    }

    // Round-trip law: the emitted CSV is sorted by column 2.
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("sweep.csv");
    report::write_csv(&path, &summary).expect("write csv");
    let content = std::fs::read_to_string(&path).expect("read csv");
    let throughputs: Vec<u64> = content
        .lines()
        .skip(1)
        .map(|line| {
            line.split(',')
                .nth(1)
                .expect("column 2")
                .parse()
                .expect("number")
        })
        .collect();
    assert_eq!(throughputs.len(), 7);
    assert!(
        throughputs.windows(2).all(|pair| pair[0] <= pair[1]),
        "CSV not sorted by throughput: {throughputs:?}"
    );
}

// ============================================================================
// S3 - interrupt mid-sweep
// ============================================================================

#[test]
#[serial]
fn test_interrupt_returns_error_and_joins_workers() {
    let server = ServerModel::new(LatencyModel::Fixed(Duration::from_millis(20)), 1);
    let factory = MockFactory::new(&server, 8);
    let config = base_config(1, Duration::from_millis(150));
    let mut manager =
        ConcurrencyManager::new(config, factory as Arc<dyn ClientFactory>).expect("manager");

    manager.step(1).expect("first step");
    manager.step(2).expect("second step");

    manager.exit_handle().store(true, Ordering::SeqCst);
    let err = manager.step(3).expect_err("interrupted step");
    assert_eq!(err, MedirError::Interrupted);

    // Teardown joins every worker; returning from drop proves it.
    drop(manager);
    assert_eq!(server.in_flight.load(Ordering::SeqCst), 0);
}

// ============================================================================
// S4 - pause without destroy
// ============================================================================

#[test]
#[serial]
fn test_pause_without_destroy() {
    let server = ServerModel::new(LatencyModel::Fixed(Duration::from_millis(20)), 1);
    let factory = MockFactory::new(&server, 8);
    let config = base_config(1, Duration::from_millis(150));
    let dyn_factory: Arc<dyn ClientFactory> = Arc::clone(&factory) as Arc<dyn ClientFactory>;
    let mut manager = ConcurrencyManager::new(config, dyn_factory).expect("manager");

    let at_four = manager.step(4).expect("step 4");
    assert_eq!(manager.worker_count(), 4);
    assert_eq!(at_four.concurrency, 4);

    let at_two = manager.step(2).expect("step 2");
    assert_eq!(manager.worker_count(), 4, "workers never destroyed");
    assert_eq!(at_two.concurrency, 2);

    let at_four_again = manager.step(4).expect("step 4 again");
    assert_eq!(manager.worker_count(), 4);
    assert_eq!(at_four_again.concurrency, 4);

    // Same contexts all the way through: no reconnect churn.
    assert_eq!(factory.contexts_created.load(Ordering::SeqCst), 4);
    // Parking half the workers halves the observed throughput.
    assert!(at_four.client_infer_per_sec > at_two.client_infer_per_sec * 3 / 2);
    assert!(at_four_again.client_infer_per_sec > at_two.client_infer_per_sec * 3 / 2);
    // Transport accumulators persisted across level changes.
    assert!(at_two.client_avg_request_time_ns > 0);
    assert!(at_four_again.client_avg_request_time_ns > 0);
}

// ============================================================================
// S5 - widen-the-window failure
// ============================================================================

#[test]
#[serial]
fn test_window_too_small_fails_explicitly() {
    let server = ServerModel::new(LatencyModel::Fixed(Duration::from_millis(100)), 1);
    let factory = MockFactory::new(&server, 8);
    let config = base_config(1, Duration::from_millis(1));
    let mut manager =
        ConcurrencyManager::new(config, factory as Arc<dyn ClientFactory>).expect("manager");

    let err = manager.step(1).expect_err("no request can complete in 1 ms");
    assert_eq!(err, MedirError::NoValidRequests);
}

// ============================================================================
// S6 - async worker parity with S1
// ============================================================================

#[test]
#[serial]
fn test_async_worker_parity() {
    let server = ServerModel::new(LatencyModel::Fixed(Duration::from_millis(50)), 4);
    let factory = MockFactory::new(&server, 8);
    let config = base_config(4, Duration::from_millis(500)).with_async_mode(true);
    let dyn_factory: Arc<dyn ClientFactory> = Arc::clone(&factory) as Arc<dyn ClientFactory>;
    let mut manager = ConcurrencyManager::new(config, dyn_factory).expect("manager");

    let status = manager.step(2).expect("step");

    assert_eq!(status.concurrency, 2);
    assert_eq!(status.batch_size, 4);
    assert!(
        (130..=190).contains(&status.client_infer_per_sec),
        "throughput {} outside expected band",
        status.client_infer_per_sec
    );
    assert!(
        (45..=60).contains(&avg_latency_ms(&status)),
        "latency {} ms outside expected band",
        avg_latency_ms(&status)
    );
    // One pipelining worker holds exactly the requested level in flight.
    assert_eq!(manager.worker_count(), 1);
    assert_eq!(factory.contexts_created.load(Ordering::SeqCst), 1);
    assert_eq!(server.max_in_flight.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Worker failure and profiling hooks
// ============================================================================

#[test]
#[serial]
fn test_batch_too_large_surfaces_as_concurrency_failure() {
    // Context advertises max batch 2; the driver asks for 4, so every
    // worker fails during setup.
    let server = ServerModel::new(LatencyModel::Fixed(Duration::from_millis(10)), 4);
    let factory = MockFactory::new(&server, 2);
    let config = base_config(4, Duration::from_millis(100));
    let mut manager =
        ConcurrencyManager::new(config, factory as Arc<dyn ClientFactory>).expect("manager");

    // The first step races worker setup: it fails either through the
    // health check or through an empty window.
    assert!(manager.step(2).is_err());
    // By the second step the worker errors are visible to the health check.
    let err = manager.step(2).expect_err("workers are dead");
    assert_eq!(err, MedirError::FailedToMaintainConcurrency);
}

#[test]
#[serial]
fn test_profile_hooks_wrap_each_measurement() {
    let server = ServerModel::new(LatencyModel::Fixed(Duration::from_millis(10)), 1);
    let factory = MockFactory::new(&server, 8);
    let config = base_config(1, Duration::from_millis(100)).with_profile(true);
    let dyn_factory: Arc<dyn ClientFactory> = Arc::clone(&factory) as Arc<dyn ClientFactory>;
    let mut manager = ConcurrencyManager::new(config, dyn_factory).expect("manager");

    manager.step(1).expect("step");
    let starts = factory.profile_starts.load(Ordering::SeqCst);
    let stops = factory.profile_stops.load(Ordering::SeqCst);
    assert!(starts >= 1);
    assert_eq!(starts, stops);
}

#[test]
#[serial]
fn test_teardown_completes_under_load() {
    let server = ServerModel::new(LatencyModel::Fixed(Duration::from_millis(30)), 1);
    let factory = MockFactory::new(&server, 8);
    let config = base_config(1, Duration::from_millis(200));
    let mut manager =
        ConcurrencyManager::new(config, factory as Arc<dyn ClientFactory>).expect("manager");

    manager.step(3).expect("step");
    // Dropping with three active workers must join them all.
    drop(manager);
    assert_eq!(server.in_flight.load(Ordering::SeqCst), 0);
}
