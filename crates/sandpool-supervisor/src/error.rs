//! Supervisor error taxonomy.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the pool supervisor.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Spawn or readiness failure; not recoverable for that worker.
    #[error("Worker startup failed: {reason}")]
    WorkerStartup { reason: String },

    /// The worker died while serving a task.
    #[error("Worker {worker_id} lost mid-task: {reason}")]
    WorkerCrash { worker_id: String, reason: String },

    /// The per-task compute deadline fired before a response arrived.
    #[error("Task exceeded its compute deadline of {timeout:?}")]
    ComputeTimeout { timeout: Duration },

    /// No warm worker became available within the acquisition deadline.
    #[error("No worker became available within {timeout:?}")]
    QueueTimeout { timeout: Duration },

    /// `compute()` was called while the pool was not running.
    #[error("Pool is not running")]
    InvalidState,

    /// Error returned by the user module, passed through unchanged.
    #[error("{name}: {message}")]
    UserCompute {
        name: String,
        message: String,
        status: u16,
    },

    /// The worker produced a malformed response document.
    #[error("Malformed worker response: {reason}")]
    Protocol { reason: String },
}

impl PoolError {
    /// HTTP-convention status code for this error kind.
    pub fn status(&self) -> u16 {
        match self {
            Self::ComputeTimeout { .. } => 408,
            Self::QueueTimeout { .. } => 429,
            Self::InvalidState => 503,
            Self::UserCompute { status, .. } => *status,
            Self::WorkerStartup { .. } | Self::WorkerCrash { .. } | Self::Protocol { .. } => 500,
        }
    }

    /// Whether the worker itself was lost, making the task eligible for a
    /// retry against a fresh worker.
    pub fn is_worker_loss(&self) -> bool {
        matches!(self, Self::WorkerCrash { .. } | Self::Protocol { .. })
    }
}
