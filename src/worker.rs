//! Load-generating workers
//!
//! A synchronous worker sustains exactly one in-flight request; K of them
//! sustain K concurrent requests. The asynchronous worker is a single
//! thread holding up to `pause_index` requests in flight through the
//! transport's pipelining surface.
//!
//! Concurrency is lowered by parking trailing workers on a condition
//! variable rather than destroying them: recreating workers would charge
//! connection setup to the measurement and retire their per-context
//! statistics early.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use rand::Rng;

use crate::client::{ClientFactory, InferContext, RunOptions};
use crate::error::{MedirError, Result};
use crate::timestamp::{MonotonicClock, StatusReport, Timestamp};

/// Pause gate shared by the controller and every worker
///
/// `pause_index` is the exclusive upper bound of active worker indices:
/// workers with index >= `pause_index` park until it grows past them.
/// The wake mutex is acquired only after any hold of the status-report
/// mutex has been released; the reverse order risks deadlock.
#[derive(Debug, Default)]
pub struct WakeGate {
    pause_index: Mutex<usize>,
    signal: Condvar,
}

impl WakeGate {
    /// Create a gate with every worker parked (pause index 0)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pause index and wake every parked worker
    pub fn set_pause_index(&self, index: usize) {
        {
            let mut pause = self.pause_index.lock().expect("wake mutex poisoned");
            *pause = index;
        }
        self.signal.notify_all();
    }

    /// Current pause index
    #[must_use]
    pub fn pause_index(&self) -> usize {
        *self.pause_index.lock().expect("wake mutex poisoned")
    }

    /// Park until `worker_index` is below the pause index or `exit` is set
    pub fn park_if_excluded(&self, worker_index: usize, exit: &AtomicBool) {
        let pause = self.pause_index.lock().expect("wake mutex poisoned");
        let _pause = self
            .signal
            .wait_while(pause, |pause| {
                worker_index >= *pause && !exit.load(Ordering::SeqCst)
            })
            .expect("wake mutex poisoned");
    }
}

/// Per-worker error cell
///
/// Owned jointly by the controller and the worker thread so the error
/// survives the thread and can be read at health checks and teardown.
#[derive(Debug, Default)]
pub struct WorkerHandle {
    error: Mutex<Option<MedirError>>,
}

impl WorkerHandle {
    /// The worker's terminal error, if it has failed
    #[must_use]
    pub fn error(&self) -> Option<MedirError> {
        self.error.lock().expect("worker handle poisoned").clone()
    }

    fn set_error(&self, err: MedirError) {
        *self.error.lock().expect("worker handle poisoned") = Some(err);
    }
}

/// Shared pieces a worker thread needs
#[derive(Clone)]
pub(crate) struct WorkerEnv {
    pub factory: Arc<dyn ClientFactory>,
    pub batch_size: u32,
    pub report: Arc<StatusReport>,
    pub gate: Arc<WakeGate>,
    pub exit: Arc<AtomicBool>,
    pub clock: Arc<MonotonicClock>,
}

/// One spawned worker: its thread plus the outliving handle
pub(crate) struct Worker {
    handle: Arc<WorkerHandle>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// The worker's terminal error, if any, without joining
    pub(crate) fn error(&self) -> Option<MedirError> {
        self.handle.error()
    }

    /// Join the thread and return its terminal error, if any
    pub(crate) fn join(&mut self) -> Option<MedirError> {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                return Some(MedirError::FailedToMaintainConcurrency);
            }
        }
        self.handle.error()
    }
}

/// Spawn a synchronous worker with the given index
pub(crate) fn spawn_sync(env: &WorkerEnv, worker_index: usize) -> Result<Worker> {
    let handle = Arc::new(WorkerHandle::default());
    let slot = env.report.register_worker();
    let thread_handle = Arc::clone(&handle);
    let env = env.clone();
    let thread = thread::Builder::new()
        .name(format!("medir-worker-{worker_index}"))
        .spawn(move || {
            if let Err(err) = run_sync(&env, slot, worker_index) {
                tracing::debug!(worker = worker_index, %err, "worker terminated");
                thread_handle.set_error(err);
            }
        })
        .map_err(|e| MedirError::Io {
            reason: e.to_string(),
        })?;
    Ok(Worker {
        handle,
        thread: Some(thread),
    })
}

/// Spawn the single asynchronous worker
pub(crate) fn spawn_async(env: &WorkerEnv) -> Result<Worker> {
    let handle = Arc::new(WorkerHandle::default());
    let slot = env.report.register_worker();
    let thread_handle = Arc::clone(&handle);
    let env = env.clone();
    let thread = thread::Builder::new()
        .name("medir-worker-async".to_string())
        .spawn(move || {
            if let Err(err) = run_async(&env, slot) {
                tracing::debug!(%err, "async worker terminated");
                thread_handle.set_error(err);
            }
        })
        .map_err(|e| MedirError::Io {
            reason: e.to_string(),
        })?;
    Ok(Worker {
        handle,
        thread: Some(thread),
    })
}

/// Check the batch size, request all outputs and bind one reusable
/// random buffer to every input
fn prepare_context(ctx: &mut dyn InferContext, batch_size: u32) -> Result<()> {
    if batch_size > ctx.max_batch_size() {
        return Err(MedirError::BatchTooLarge {
            batch_size,
            max_batch_size: ctx.max_batch_size(),
            model: ctx.model_name().to_string(),
        });
    }

    let options = RunOptions {
        batch_size,
        outputs: ctx.outputs().to_vec(),
    };
    ctx.set_run_options(&options)?;

    let mut max_input_byte_size: i64 = 0;
    for input in ctx.inputs() {
        let byte_size = input.byte_size();
        if byte_size < 0 {
            return Err(MedirError::VariableSizeInput {
                input: input.name().to_string(),
                model: ctx.model_name().to_string(),
            });
        }
        max_input_byte_size = max_input_byte_size.max(byte_size);
    }

    // One random buffer sized to the largest input, reused for every batch
    // entry of every input.
    let mut buffer = vec![0u8; usize::try_from(max_input_byte_size).unwrap_or(0)];
    rand::thread_rng().fill(buffer.as_mut_slice());

    for input in ctx.inputs_mut() {
        input.reset();
        let len = usize::try_from(input.byte_size()).unwrap_or(0);
        for _ in 0..batch_size {
            input.set_raw(&buffer[..len])?;
        }
    }
    Ok(())
}

fn run_sync(env: &WorkerEnv, slot: usize, worker_index: usize) -> Result<()> {
    let mut ctx = env.factory.infer_context()?;
    prepare_context(ctx.as_mut(), env.batch_size)?;

    loop {
        let start_ns = env.clock.now_ns();
        ctx.run()?;
        let end_ns = env.clock.now_ns();

        env.report
            .record(slot, Timestamp::new(start_ns, end_ns), ctx.stat());

        env.gate.park_if_excluded(worker_index, &env.exit);
        if env.exit.load(Ordering::SeqCst) {
            return Ok(());
        }
    }
}

fn run_async(env: &WorkerEnv, slot: usize) -> Result<()> {
    let mut ctx = env.factory.infer_context()?;
    prepare_context(ctx.as_mut(), env.batch_size)?;

    let mut starts: HashMap<u64, u64> = HashMap::new();
    loop {
        if env.exit.load(Ordering::SeqCst) {
            return Ok(());
        }

        if env.gate.pause_index() == 0 && starts.is_empty() {
            env.gate.park_if_excluded(0, &env.exit);
            continue;
        }

        // Submit until the number of in-flight requests matches the
        // current concurrency level.
        while starts.len() < env.gate.pause_index() {
            let start_ns = env.clock.now_ns();
            let id = ctx.async_run()?;
            starts.insert(id, start_ns);
        }

        // Drain completions: block while at capacity, otherwise only take
        // what is already finished so the worker can refill.
        while !starts.is_empty() {
            let blocking = starts.len() >= env.gate.pause_index();
            let Some(id) = ctx.get_ready_async_request(blocking)? else {
                break;
            };
            ctx.get_async_run_results(id)?;
            let end_ns = env.clock.now_ns();
            let start_ns = starts
                .remove(&id)
                .ok_or(MedirError::UnknownAsyncRequest { id })?;

            env.report
                .record(slot, Timestamp::new(start_ns, end_ns), ctx.stat());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_gate_starts_at_zero() {
        let gate = WakeGate::new();
        assert_eq!(gate.pause_index(), 0);
    }

    #[test]
    fn test_set_pause_index() {
        let gate = WakeGate::new();
        gate.set_pause_index(4);
        assert_eq!(gate.pause_index(), 4);
    }

    #[test]
    fn test_included_worker_does_not_park() {
        let gate = WakeGate::new();
        gate.set_pause_index(2);
        let exit = AtomicBool::new(false);
        // Returns immediately: index 1 < pause index 2.
        gate.park_if_excluded(1, &exit);
    }

    #[test]
    fn test_parked_worker_wakes_on_pause_increase() {
        let gate = Arc::new(WakeGate::new());
        let exit = Arc::new(AtomicBool::new(false));

        let parked = {
            let gate = Arc::clone(&gate);
            let exit = Arc::clone(&exit);
            thread::spawn(move || gate.park_if_excluded(3, &exit))
        };

        thread::sleep(Duration::from_millis(50));
        gate.set_pause_index(4);
        parked.join().expect("parked worker should wake");
    }

    #[test]
    fn test_parked_worker_wakes_on_exit() {
        let gate = Arc::new(WakeGate::new());
        let exit = Arc::new(AtomicBool::new(false));

        let parked = {
            let gate = Arc::clone(&gate);
            let exit = Arc::clone(&exit);
            thread::spawn(move || gate.park_if_excluded(0, &exit))
        };

        thread::sleep(Duration::from_millis(50));
        exit.store(true, Ordering::SeqCst);
        gate.set_pause_index(0);
        parked.join().expect("parked worker should wake on exit");
    }

    #[test]
    fn test_worker_handle_records_error() {
        let handle = WorkerHandle::default();
        assert_eq!(handle.error(), None);
        handle.set_error(MedirError::Interrupted);
        assert_eq!(handle.error(), Some(MedirError::Interrupted));
    }
}
