//! Pool configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for a worker pool. Immutable once the pool has started.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Directory holding the per-worker Unix sockets. Created with mode 0700.
    pub work_dir: PathBuf,

    /// Number of warm workers to keep alive.
    pub pool_size: usize,

    /// Grace period between SIGTERM and SIGKILL when terminating a worker.
    pub kill_timeout: Duration,

    /// Deadline for acquiring a warm worker before a task is rejected.
    pub queue_wait_timeout: Duration,

    /// A worker is replaced after serving this many tasks.
    pub recycle_threshold: u32,

    /// Deadline for a freshly spawned worker to create its socket.
    pub readiness_timeout: Duration,

    /// Additional attempts against a fresh worker after a crash mid-task.
    pub retries: u32,

    /// Worker executable. When unset, resolved as `sandpool-worker` next to
    /// the supervisor's own executable.
    pub worker_bin: Option<PathBuf>,

    /// Upper bound on a single wire document.
    pub max_document_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("sandpool"),
            pool_size: 4,
            kill_timeout: Duration::from_secs(5),
            queue_wait_timeout: Duration::from_secs(10),
            recycle_threshold: 128,
            readiness_timeout: Duration::from_secs(3),
            retries: 1,
            worker_bin: None,
            max_document_bytes: crate::wire::DEFAULT_MAX_DOCUMENT_BYTES,
        }
    }
}

impl PoolConfig {
    /// Create a config rooted at the given work directory.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..Default::default()
        }
    }

    /// Set the number of warm workers.
    #[must_use]
    pub const fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set the SIGTERM-to-SIGKILL grace period.
    #[must_use]
    pub const fn with_kill_timeout(mut self, timeout: Duration) -> Self {
        self.kill_timeout = timeout;
        self
    }

    /// Set the acquisition deadline.
    #[must_use]
    pub const fn with_queue_wait_timeout(mut self, timeout: Duration) -> Self {
        self.queue_wait_timeout = timeout;
        self
    }

    /// Set the per-worker recycle threshold.
    #[must_use]
    pub const fn with_recycle_threshold(mut self, threshold: u32) -> Self {
        self.recycle_threshold = threshold;
        self
    }

    /// Set the worker readiness deadline.
    #[must_use]
    pub const fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    /// Set the crash retry budget.
    #[must_use]
    pub const fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set an explicit worker executable path.
    #[must_use]
    pub fn with_worker_bin(mut self, worker_bin: impl Into<PathBuf>) -> Self {
        self.worker_bin = Some(worker_bin.into());
        self
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::Config("pool_size must be at least 1".into()));
        }
        if self.recycle_threshold == 0 {
            return Err(Error::Config("recycle_threshold must be at least 1".into()));
        }
        if self.kill_timeout.is_zero() {
            return Err(Error::Config("kill_timeout must be non-zero".into()));
        }
        if self.queue_wait_timeout.is_zero() {
            return Err(Error::Config("queue_wait_timeout must be non-zero".into()));
        }
        if self.readiness_timeout.is_zero() {
            return Err(Error::Config("readiness_timeout must be non-zero".into()));
        }
        if self.max_document_bytes == 0 {
            return Err(Error::Config("max_document_bytes must be non-zero".into()));
        }
        Ok(())
    }
}
