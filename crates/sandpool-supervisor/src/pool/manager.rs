//! Pool manager: owns the warm workers and serves `compute()` callers.
//!
//! The pool keeps its warm workers in a FIFO ring guarded by a fair
//! semaphore: acquisition takes from the front, healthy workers return to
//! the back, and waiters that arrived while the ring was empty are served
//! in arrival order. A single-flight background job restores pool size
//! whenever a worker is recycled, crashes, or fails readiness. A janitor
//! task consumes exit notifications for crash detection.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, Semaphore, broadcast, mpsc};
use tracing::{debug, info, warn};

use sandpool_core::PoolConfig;
use sandpool_core::wire::WireResponse;

use crate::error::PoolError;
use crate::pool::events::PoolEvent;
use crate::pool::handle::WorkerHandle;
use crate::pool::ComputeTask;

/// Attempts before a repopulation run gives up until the next pool event.
const MAX_SPAWN_ATTEMPTS: u32 = 10;

/// Ceiling for the repopulation backoff.
const SPAWN_BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Worker-pool supervisor.
///
/// Cheap to clone; all clones share the same pool. Every method takes
/// `&self` and is safe to call from concurrent tasks.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    events: broadcast::Sender<PoolEvent>,
    state: Mutex<PoolState>,
    /// Single-flight guard for background repopulation.
    repopulating: AtomicBool,
    exited_tx: mpsc::UnboundedSender<String>,
    /// Consumed by the janitor on first start.
    exited_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

struct PoolState {
    lifecycle: Lifecycle,
    worker_bin: Option<PathBuf>,
    /// Permits track the ring occupancy; fair FIFO among waiters.
    slots: Arc<Semaphore>,
    /// Warm workers, least-recently-used first.
    ring: VecDeque<Arc<WorkerHandle>>,
    /// Every live handle: warm, checked out, or terminating. `stop()`
    /// terminates and awaits all of them.
    workers: Vec<Arc<WorkerHandle>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl Pool {
    /// Create a pool from a validated configuration. Spawns nothing until
    /// [`Self::start`].
    pub fn new(config: PoolConfig) -> sandpool_core::Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(256);
        let (exited_tx, exited_rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                events,
                state: Mutex::new(PoolState {
                    lifecycle: Lifecycle::Stopped,
                    worker_bin: None,
                    slots: Arc::new(Semaphore::new(0)),
                    ring: VecDeque::new(),
                    workers: Vec::new(),
                }),
                repopulating: AtomicBool::new(false),
                exited_tx,
                exited_rx: Mutex::new(Some(exited_rx)),
            }),
        })
    }

    /// Subscribe to pool lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Whether the pool currently accepts tasks.
    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.lifecycle == Lifecycle::Running
    }

    /// Number of live workers not scheduled for termination.
    pub async fn live_workers(&self) -> usize {
        let state = self.inner.state.lock().await;
        live_count(&state)
    }

    /// Start the pool: create the work directory, spawn `pool_size` workers,
    /// and wait until every one is ready. Idempotent.
    ///
    /// On any spawn or readiness failure, every worker spawned so far is
    /// terminated before the error surfaces.
    pub async fn start(&self) -> Result<(), PoolError> {
        let config = &self.inner.config;
        let worker_bin = resolve_worker_bin(config)?;

        {
            let mut state = self.inner.state.lock().await;
            match state.lifecycle {
                Lifecycle::Running | Lifecycle::Starting => return Ok(()),
                Lifecycle::Stopping => return Err(PoolError::InvalidState),
                Lifecycle::Stopped => {}
            }
            state.lifecycle = Lifecycle::Starting;
            state.worker_bin = Some(worker_bin.clone());
            state.slots = Arc::new(Semaphore::new(0));
            state.ring.clear();
            state.workers.clear();
        }

        // The janitor lives for the pool's lifetime, across restarts. It
        // holds only a weak reference so a dropped pool can be reclaimed.
        if let Some(rx) = self.inner.exited_rx.lock().await.take() {
            tokio::spawn(janitor(Arc::downgrade(&self.inner), rx));
        }

        if let Err(e) = create_work_dir(&config.work_dir).await {
            self.inner.state.lock().await.lifecycle = Lifecycle::Stopped;
            return Err(PoolError::WorkerStartup {
                reason: format!(
                    "failed to create work dir {}: {e}",
                    config.work_dir.display()
                ),
            });
        }

        // Spawn every child first so they boot concurrently, then observe
        // readiness one by one.
        let mut spawned = Vec::with_capacity(config.pool_size);
        let mut failure = None;
        for _ in 0..config.pool_size {
            match WorkerHandle::spawn(&worker_bin, &config.work_dir, self.inner.exited_tx.clone())
            {
                Ok(handle) => spawned.push(handle),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if failure.is_none() {
            for handle in &spawned {
                if let Err(e) = handle.wait_ready(config.readiness_timeout).await {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            warn!(error = %e, "Pool startup failed, terminating spawned workers");
            terminate_all(spawned, config.kill_timeout).await;
            self.inner.state.lock().await.lifecycle = Lifecycle::Stopped;
            return Err(e);
        }

        {
            let mut state = self.inner.state.lock().await;
            if state.lifecycle != Lifecycle::Starting {
                // stop() won the race; it owns the lifecycle now.
                drop(state);
                terminate_all(spawned, config.kill_timeout).await;
                return Err(PoolError::InvalidState);
            }
            for handle in spawned {
                let _ = self.inner.events.send(PoolEvent::Spawn {
                    worker_id: handle.id().to_string(),
                });
                state.workers.push(Arc::clone(&handle));
                state.ring.push_back(handle);
                state.slots.add_permits(1);
            }
            state.lifecycle = Lifecycle::Running;
        }

        info!(
            pool_size = config.pool_size,
            work_dir = %config.work_dir.display(),
            "Worker pool started"
        );
        Ok(())
    }

    /// Stop the pool, terminating every live worker (SIGTERM, then SIGKILL
    /// after the kill timeout). Idempotent and best-effort: never fails.
    pub async fn stop(&self) {
        let handles = {
            let mut state = self.inner.state.lock().await;
            match state.lifecycle {
                Lifecycle::Stopped | Lifecycle::Stopping => return,
                Lifecycle::Starting | Lifecycle::Running => {}
            }
            state.lifecycle = Lifecycle::Stopping;
            // Closing the semaphore wakes queued acquirers; they observe the
            // stop and fail with InvalidState.
            state.slots.close();
            state.ring.clear();
            std::mem::take(&mut state.workers)
        };

        info!(workers = handles.len(), "Stopping worker pool");
        terminate_all(handles, self.inner.config.kill_timeout).await;

        self.inner.state.lock().await.lifecycle = Lifecycle::Stopped;
        info!("Worker pool stopped");
    }

    /// Run one task on a warm worker and return the module's result.
    ///
    /// Worker-loss failures (crash, malformed response) are retried against
    /// a fresh worker up to the configured retry budget; timeouts and user
    /// module errors surface directly.
    pub async fn compute(&self, task: ComputeTask) -> Result<Value, PoolError> {
        let config = &self.inner.config;
        let mut attempts_left = config.retries;
        loop {
            let handle =
                match tokio::time::timeout(config.queue_wait_timeout, self.acquire()).await {
                    Ok(acquired) => acquired?,
                    Err(_) => {
                        return Err(PoolError::QueueTimeout {
                            timeout: config.queue_wait_timeout,
                        });
                    }
                };

            let guard = handle.begin_task();
            let served = handle.record_task();
            let recycle_due = served % config.recycle_threshold == 0;
            if recycle_due {
                debug!(worker_id = %handle.id(), served, "Recycle threshold reached");
                handle.schedule_termination(config.kill_timeout);
                let _ = self.inner.events.send(PoolEvent::Recycle {
                    worker_id: handle.id().to_string(),
                });
                self.trigger_repopulate();
            }

            let outcome = handle.compute(&task, config.max_document_bytes).await;
            drop(guard);

            match outcome {
                Ok(WireResponse::Result { value, .. }) => {
                    self.release(handle).await;
                    return Ok(value);
                }
                Ok(WireResponse::Error(err)) => {
                    // A user-level error leaves the worker healthy.
                    self.release(handle).await;
                    return Err(PoolError::UserCompute {
                        name: err.name,
                        message: err.message,
                        status: err.status,
                    });
                }
                Err(err @ PoolError::ComputeTimeout { .. }) => {
                    // A timed-out worker may still be busy: tainted.
                    warn!(worker_id = %handle.id(), "Task timed out, discarding worker");
                    self.discard(&handle);
                    return Err(err);
                }
                Err(err) if err.is_worker_loss() => {
                    warn!(worker_id = %handle.id(), error = %err, "Worker lost mid-task");
                    self.discard(&handle);
                    if attempts_left == 0 {
                        return Err(err);
                    }
                    attempts_left -= 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Take a usable worker from the front of the ring, waiting for a spawn
    /// if the ring is empty. Waiters are served in FIFO order.
    async fn acquire(&self) -> Result<Arc<WorkerHandle>, PoolError> {
        loop {
            let slots = {
                let state = self.inner.state.lock().await;
                if state.lifecycle != Lifecycle::Running {
                    return Err(PoolError::InvalidState);
                }
                Arc::clone(&state.slots)
            };

            if slots.available_permits() == 0 {
                // Ring drained: make sure a repopulation is in flight.
                self.trigger_repopulate();
            }

            let Ok(permit) = slots.acquire().await else {
                // Closed by stop().
                return Err(PoolError::InvalidState);
            };
            permit.forget();

            let popped = {
                let mut state = self.inner.state.lock().await;
                state.ring.pop_front()
            };
            let Some(handle) = popped else {
                // The janitor reaped the handle behind this permit.
                continue;
            };

            if handle.is_ready() && !handle.is_terminating() && !handle.has_exited() {
                return Ok(handle);
            }

            // Stale entry: make sure it dies, then look for another.
            debug!(worker_id = %handle.id(), "Discarding stale pooled worker");
            self.discard(&handle);
        }
    }

    /// Return a healthy worker to the back of the ring.
    async fn release(&self, handle: Arc<WorkerHandle>) {
        let returned = {
            let mut state = self.inner.state.lock().await;
            if state.lifecycle == Lifecycle::Running
                && !handle.is_terminating()
                && !handle.has_exited()
            {
                state.ring.push_back(handle);
                state.slots.add_permits(1);
                true
            } else {
                false
            }
        };
        if !returned {
            // The worker left service while checked out; restore capacity.
            self.trigger_repopulate();
        }
    }

    /// Pull a worker out of service and make sure its process dies. The
    /// handle stays registered until its exit is observed, so `stop()` can
    /// await it.
    fn discard(&self, handle: &Arc<WorkerHandle>) {
        handle.schedule_termination(self.inner.config.kill_timeout);
        self.trigger_repopulate();
    }

    /// Kick off a background repopulation unless one is already in flight.
    fn trigger_repopulate(&self) {
        trigger_repopulate(&self.inner);
    }
}

/// Consume worker-exit notifications: drop dead handles, fire events, and
/// restore pool size after unexpected deaths.
async fn janitor(inner: Weak<PoolInner>, mut exited_rx: mpsc::UnboundedReceiver<String>) {
    while let Some(worker_id) = exited_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let (was_pooled, running) = {
            let mut state = inner.state.lock().await;
            let ring_before = state.ring.len();
            state.ring.retain(|h| h.id() != worker_id);
            let was_pooled = state.ring.len() != ring_before;
            state.workers.retain(|h| h.id() != worker_id);
            (was_pooled, state.lifecycle == Lifecycle::Running)
        };
        debug!(worker_id = %worker_id, was_pooled, "Worker exit observed");
        let _ = inner.events.send(PoolEvent::WorkerExit { worker_id });
        if was_pooled && running {
            // Died while warm in the ring; its semaphore permit is now
            // stale, which acquire() tolerates.
            trigger_repopulate(&inner);
        }
    }
}

fn trigger_repopulate(inner: &Arc<PoolInner>) {
    if inner
        .repopulating
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
        .is_err()
    {
        // Single flight: coalesce with the run already in progress.
        return;
    }
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let filled = repopulate(&inner).await;
        inner.repopulating.store(false, Ordering::SeqCst);
        // Demand may have raced with the tail of the run just finished.
        if filled && deficit(&inner).await > 0 {
            trigger_repopulate(&inner);
        }
    });
}

/// Spawn workers until pool size is restored. Returns `false` when the run
/// gave up (pool stopped, or spawn attempts exhausted) and must not be
/// immediately re-triggered.
async fn repopulate(inner: &Arc<PoolInner>) -> bool {
    let mut failures: u32 = 0;
    loop {
        let (worker_bin, running) = {
            let state = inner.state.lock().await;
            (
                state.worker_bin.clone(),
                state.lifecycle == Lifecycle::Running,
            )
        };
        if !running {
            return false;
        }
        let Some(worker_bin) = worker_bin else {
            return false;
        };
        if deficit(inner).await == 0 {
            return true;
        }

        // Give awaiting callers a chance to run before the spawn lands.
        tokio::task::yield_now().await;

        match spawn_ready(inner, &worker_bin).await {
            Ok(handle) => {
                failures = 0;
                let installed = {
                    let mut state = inner.state.lock().await;
                    if state.lifecycle == Lifecycle::Running {
                        state.workers.push(Arc::clone(&handle));
                        state.ring.push_back(Arc::clone(&handle));
                        state.slots.add_permits(1);
                        true
                    } else {
                        false
                    }
                };
                if installed {
                    debug!(worker_id = %handle.id(), "Worker joined the pool");
                    let _ = inner.events.send(PoolEvent::Spawn {
                        worker_id: handle.id().to_string(),
                    });
                } else {
                    handle.terminate(inner.config.kill_timeout).await;
                    return false;
                }
            }
            Err(e) => {
                failures += 1;
                warn!(error = %e, failures, "Worker spawn failed during repopulation");
                let _ = inner.events.send(PoolEvent::SpawnError {
                    reason: e.to_string(),
                });
                if failures >= MAX_SPAWN_ATTEMPTS {
                    warn!("Giving up on repopulation until the next pool event");
                    return false;
                }
                tokio::time::sleep(spawn_backoff(failures)).await;
            }
        }
    }
}

/// Spawn one worker and wait for its socket; kill it on readiness failure.
async fn spawn_ready(
    inner: &Arc<PoolInner>,
    worker_bin: &Path,
) -> Result<Arc<WorkerHandle>, PoolError> {
    let handle = WorkerHandle::spawn(
        worker_bin,
        &inner.config.work_dir,
        inner.exited_tx.clone(),
    )?;
    if let Err(e) = handle.wait_ready(inner.config.readiness_timeout).await {
        handle.terminate(inner.config.kill_timeout).await;
        return Err(e);
    }
    Ok(handle)
}

/// How many workers are missing from the target size.
async fn deficit(inner: &Arc<PoolInner>) -> usize {
    let state = inner.state.lock().await;
    if state.lifecycle != Lifecycle::Running {
        return 0;
    }
    inner.config.pool_size.saturating_sub(live_count(&state))
}

fn live_count(state: &PoolState) -> usize {
    state
        .workers
        .iter()
        .filter(|h| !h.is_terminating() && !h.has_exited())
        .count()
}

async fn terminate_all(handles: Vec<Arc<WorkerHandle>>, kill_timeout: Duration) {
    let mut tasks = Vec::with_capacity(handles.len());
    for handle in handles {
        tasks.push(tokio::spawn(async move {
            handle.terminate(kill_timeout).await;
        }));
    }
    for task in tasks {
        let _ = task.await;
    }
}

/// Exponential backoff for spawn failures: 50 ms doubling, capped at 1 s.
fn spawn_backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(10);
    Duration::from_millis(50)
        .saturating_mul(1 << exp)
        .min(SPAWN_BACKOFF_CAP)
}

async fn create_work_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::create_dir_all(dir).await?;
    let mut perms = tokio::fs::metadata(dir).await?.permissions();
    perms.set_mode(0o700);
    tokio::fs::set_permissions(dir, perms).await?;
    Ok(())
}

/// The worker binary ships next to the supervisor's own executable unless
/// the configuration says otherwise.
fn resolve_worker_bin(config: &PoolConfig) -> Result<PathBuf, PoolError> {
    if let Some(bin) = &config.worker_bin {
        return Ok(bin.clone());
    }
    let exe = std::env::current_exe().map_err(|e| PoolError::WorkerStartup {
        reason: format!("cannot locate own executable: {e}"),
    })?;
    let dir = exe.parent().ok_or_else(|| PoolError::WorkerStartup {
        reason: "own executable has no parent directory".into(),
    })?;
    Ok(dir.join("sandpool-worker"))
}
