//! Pool lifecycle events.

/// Notifications emitted by the pool as workers come and go.
///
/// Delivered over a broadcast channel; see [`Pool::subscribe`](super::Pool::subscribe).
/// Slow subscribers may observe lagged receives, never blocked pools.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A worker joined the pool and is ready to serve.
    Spawn { worker_id: String },
    /// A worker hit the recycle threshold and is being replaced.
    Recycle { worker_id: String },
    /// A background spawn attempt failed.
    SpawnError { reason: String },
    /// A worker process exited.
    WorkerExit { worker_id: String },
}
