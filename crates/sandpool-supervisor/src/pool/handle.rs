//! Worker handle: supervisor-side proxy for one worker subprocess.
//!
//! A handle owns the child process and its socket path. It tracks readiness,
//! the number of tasks served, and in-flight connections, and it guarantees
//! that the child is signalled for termination at most once. A monitor task
//! publishes the child's exit so the pool can react to crashes even while the
//! handle is checked out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use sandpool_core::wire::{self, WireRequest, WireResponse};

use crate::error::PoolError;
use crate::pool::ComputeTask;

/// Base interval for readiness polling; grows with each attempt.
const READY_POLL_BASE: Duration = Duration::from_millis(20);

/// Supervisor-side state for a single worker subprocess.
pub(crate) struct WorkerHandle {
    id: String,
    socket_path: PathBuf,
    pid: Option<u32>,
    ready: AtomicBool,
    terminating: AtomicBool,
    signalled: AtomicBool,
    tasks_processed: AtomicU32,
    /// In-flight task count; the termination finalizer waits for zero.
    pending_tx: watch::Sender<usize>,
    /// Exit code of the child once it has been observed.
    exit_rx: watch::Receiver<Option<i32>>,
}

impl WorkerHandle {
    /// Fork the worker binary, passing the socket path as its sole argument.
    ///
    /// The child's environment is cleared; stdio is inherited so worker
    /// diagnostics reach the supervisor's stderr. Returns immediately:
    /// readiness is a separate step ([`Self::wait_ready`]).
    pub(crate) fn spawn(
        worker_bin: &Path,
        work_dir: &Path,
        exited_tx: mpsc::UnboundedSender<String>,
    ) -> Result<Arc<Self>, PoolError> {
        let id = new_worker_id();
        let socket_path = work_dir.join(format!("{id}.sock"));

        let mut child = Command::new(worker_bin)
            .arg(&socket_path)
            .env_clear()
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PoolError::WorkerStartup {
                reason: format!("failed to spawn {}: {e}", worker_bin.display()),
            })?;

        let pid = child.id();
        let (pending_tx, _) = watch::channel(0usize);
        let (exit_tx, exit_rx) = watch::channel(None);

        debug!(worker_id = %id, pid, socket = %socket_path.display(), "Spawned worker");

        let handle = Arc::new(Self {
            id,
            socket_path,
            pid,
            ready: AtomicBool::new(false),
            terminating: AtomicBool::new(false),
            signalled: AtomicBool::new(false),
            tasks_processed: AtomicU32::new(0),
            pending_tx,
            exit_rx,
        });

        // Monitor task: await the child's exit, clean up the socket file,
        // publish the status, and notify the pool's janitor.
        let monitor_id = handle.id.clone();
        let monitor_socket = handle.socket_path.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!(worker_id = %monitor_id, error = %e, "Failed to await worker exit");
                    -1
                }
            };
            let _ = tokio::fs::remove_file(&monitor_socket).await;
            debug!(worker_id = %monitor_id, code, "Worker exited");
            let _ = exit_tx.send(Some(code));
            let _ = exited_tx.send(monitor_id);
        });

        Ok(handle)
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Count a task against this worker; returns the new total.
    pub(crate) fn record_task(&self) -> u32 {
        self.tasks_processed.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Poll for the worker's socket file with geometric backoff.
    pub(crate) async fn wait_ready(&self, timeout: Duration) -> Result<(), PoolError> {
        let deadline = Instant::now() + timeout;
        let mut attempt: u32 = 0;
        loop {
            if tokio::fs::metadata(&self.socket_path).await.is_ok() {
                self.ready.store(true, Ordering::Release);
                return Ok(());
            }
            if self.has_exited() {
                return Err(PoolError::WorkerStartup {
                    reason: format!("worker {} exited before creating its socket", self.id),
                });
            }
            attempt += 1;
            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::WorkerStartup {
                    reason: format!("worker {} socket not ready within {timeout:?}", self.id),
                });
            }
            let backoff = READY_POLL_BASE.saturating_mul(attempt);
            tokio::time::sleep(backoff.min(deadline - now)).await;
        }
    }

    /// Register an in-flight task. The guard keeps the termination finalizer
    /// from firing until the task is done.
    pub(crate) fn begin_task(self: &Arc<Self>) -> TaskGuard {
        self.pending_tx.send_modify(|n| *n += 1);
        TaskGuard {
            handle: Arc::clone(self),
        }
    }

    /// Run one task over a fresh socket connection, bounded by the task's
    /// deadline. Concurrent calls open independent connections.
    pub(crate) async fn compute(
        &self,
        task: &ComputeTask,
        max_document_bytes: usize,
    ) -> Result<WireResponse, PoolError> {
        match tokio::time::timeout(task.timeout, self.exchange(task, max_document_bytes)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PoolError::ComputeTimeout {
                timeout: task.timeout,
            }),
        }
    }

    async fn exchange(
        &self,
        task: &ComputeTask,
        max_document_bytes: usize,
    ) -> Result<WireResponse, PoolError> {
        let mut stream =
            UnixStream::connect(&self.socket_path)
                .await
                .map_err(|e| PoolError::WorkerCrash {
                    worker_id: self.id.clone(),
                    reason: format!("connect to {} failed: {e}", self.socket_path.display()),
                })?;

        let request = WireRequest {
            module_url: task.module_url.clone(),
            params: task.params.clone(),
        };
        let body = serde_json::to_vec(&request).map_err(|e| PoolError::Protocol {
            reason: format!("failed to encode request: {e}"),
        })?;

        wire::write_document(&mut stream, &body)
            .await
            .map_err(|e| self.classify_wire_error("request write", e))?;

        let response = wire::read_document(&mut stream, max_document_bytes)
            .await
            .map_err(|e| self.classify_wire_error("response read", e))?;

        WireResponse::from_slice(&response).map_err(|e| self.classify_wire_error("response", e))
    }

    /// Map a wire-layer failure onto the supervisor taxonomy: I/O means the
    /// worker is gone, anything else is a protocol violation.
    fn classify_wire_error(&self, stage: &str, err: sandpool_core::Error) -> PoolError {
        match err {
            sandpool_core::Error::Io(e) => PoolError::WorkerCrash {
                worker_id: self.id.clone(),
                reason: format!("{stage} failed: {e}"),
            },
            other => PoolError::Protocol {
                reason: format!("{stage}: {other}"),
            },
        }
    }

    /// Mark the handle for termination and send SIGTERM once all in-flight
    /// tasks have drained. Idempotent.
    pub(crate) fn schedule_termination(self: &Arc<Self>, kill_timeout: Duration) {
        if self.terminating.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(worker_id = %self.id, "Termination scheduled");
        let handle = Arc::clone(self);
        tokio::spawn(async move {
            let mut pending = handle.pending_tx.subscribe();
            let _ = pending.wait_for(|n| *n == 0).await;
            handle.terminate(kill_timeout).await;
        });
    }

    /// Terminate unconditionally: SIGTERM, wait `kill_timeout`, escalate to
    /// SIGKILL. Resolves once the child has exited; never fails.
    pub(crate) async fn terminate(&self, kill_timeout: Duration) {
        self.terminating.store(true, Ordering::Release);
        if self.has_exited() {
            return;
        }
        if !self.signalled.swap(true, Ordering::AcqRel) {
            self.signal(libc::SIGTERM);
        }
        let mut exit_rx = self.exit_rx.clone();
        let wait_exited = async {
            while exit_rx.borrow().is_none() {
                if exit_rx.changed().await.is_err() {
                    break;
                }
            }
        };
        let timed_out = tokio::time::timeout(kill_timeout, wait_exited)
            .await
            .is_err();
        if timed_out {
            warn!(
                worker_id = %self.id,
                ?kill_timeout,
                "Worker ignored SIGTERM, escalating to SIGKILL"
            );
            self.signal(libc::SIGKILL);
            while exit_rx.borrow().is_none() {
                if exit_rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    fn signal(&self, signal: libc::c_int) {
        let Some(pid) = self.pid else { return };
        // SAFETY: pid is a valid process ID obtained from our own Child
        // handle. kill(2) is safe to call on any owned subprocess.
        #[allow(unsafe_code, clippy::cast_possible_wrap)]
        let ret = unsafe { libc::kill(pid as i32, signal) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            debug!(worker_id = %self.id, pid, signal, error = %err, "kill(2) failed");
        }
    }
}

/// Guard for one in-flight task; dropping it releases the slot.
pub(crate) struct TaskGuard {
    handle: Arc<WorkerHandle>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.handle
            .pending_tx
            .send_modify(|n| *n = n.saturating_sub(1));
    }
}

fn new_worker_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Write a fake worker script into `dir` and return its path.
    fn fake_worker(dir: &Path, script_body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-worker.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{script_body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn exit_channel() -> (
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<String>,
    ) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn worker_ids_are_16_hex_chars() {
        let id = new_worker_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn spawn_missing_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = exit_channel();

        let result = WorkerHandle::spawn(Path::new("/nonexistent/worker"), dir.path(), tx);
        assert!(matches!(
            result,
            Err(PoolError::WorkerStartup { .. })
        ));
    }

    #[tokio::test]
    async fn wait_ready_observes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_worker(dir.path(), "touch \"$1\"\nexec sleep 60");
        let (tx, _rx) = exit_channel();

        let handle = WorkerHandle::spawn(&bin, dir.path(), tx).unwrap();
        handle.wait_ready(Duration::from_secs(5)).await.unwrap();
        assert!(handle.is_ready());

        handle.terminate(Duration::from_secs(2)).await;
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn wait_ready_times_out_without_socket() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_worker(dir.path(), "exec sleep 60");
        let (tx, _rx) = exit_channel();

        let handle = WorkerHandle::spawn(&bin, dir.path(), tx).unwrap();
        let err = handle.wait_ready(Duration::from_millis(200)).await;
        assert!(matches!(err, Err(PoolError::WorkerStartup { .. })));

        handle.terminate(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn wait_ready_fails_fast_when_worker_dies() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_worker(dir.path(), "exit 3");
        let (tx, _rx) = exit_channel();

        let handle = WorkerHandle::spawn(&bin, dir.path(), tx).unwrap();
        // Generous budget: the exit should cut the wait short.
        let err = handle.wait_ready(Duration::from_secs(30)).await;
        assert!(matches!(err, Err(PoolError::WorkerStartup { .. })));
    }

    #[tokio::test]
    async fn monitor_removes_socket_and_reports_exit() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_worker(dir.path(), "touch \"$1\"\nexec sleep 60");
        let (tx, mut rx) = exit_channel();

        let handle = WorkerHandle::spawn(&bin, dir.path(), tx).unwrap();
        handle.wait_ready(Duration::from_secs(5)).await.unwrap();
        let socket = dir.path().join(format!("{}.sock", handle.id()));
        assert!(socket.exists());

        handle.terminate(Duration::from_secs(2)).await;

        let exited_id = rx.recv().await.unwrap();
        assert_eq!(exited_id, handle.id());
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn scheduled_termination_waits_for_inflight_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_worker(dir.path(), "touch \"$1\"\nexec sleep 60");
        let (tx, _rx) = exit_channel();

        let handle = WorkerHandle::spawn(&bin, dir.path(), tx).unwrap();
        handle.wait_ready(Duration::from_secs(5)).await.unwrap();

        let guard = handle.begin_task();
        handle.schedule_termination(Duration::from_secs(2));
        assert!(handle.is_terminating());

        // The in-flight guard holds the SIGTERM back.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!handle.has_exited());

        drop(guard);
        let mut exit_rx = handle.exit_rx.clone();
        tokio::time::timeout(Duration::from_secs(5), exit_rx.wait_for(|c| c.is_some()))
            .await
            .expect("worker should exit after the task drains")
            .unwrap();
    }

    #[tokio::test]
    async fn schedule_termination_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_worker(dir.path(), "touch \"$1\"\nexec sleep 60");
        let (tx, _rx) = exit_channel();

        let handle = WorkerHandle::spawn(&bin, dir.path(), tx).unwrap();
        handle.wait_ready(Duration::from_secs(5)).await.unwrap();

        handle.schedule_termination(Duration::from_secs(2));
        handle.schedule_termination(Duration::from_secs(2));

        let mut exit_rx = handle.exit_rx.clone();
        tokio::time::timeout(Duration::from_secs(5), exit_rx.wait_for(|c| c.is_some()))
            .await
            .expect("worker should exit once")
            .unwrap();
    }

    #[tokio::test]
    async fn sigkill_escalation_for_stubborn_worker() {
        let dir = tempfile::tempdir().unwrap();
        // Trap and ignore SIGTERM so only SIGKILL can end it.
        let bin = fake_worker(dir.path(), "trap '' TERM\ntouch \"$1\"\nwhile true; do sleep 1; done");
        let (tx, _rx) = exit_channel();

        let handle = WorkerHandle::spawn(&bin, dir.path(), tx).unwrap();
        handle.wait_ready(Duration::from_secs(5)).await.unwrap();

        handle.terminate(Duration::from_millis(300)).await;
        assert!(handle.has_exited());
    }
}
