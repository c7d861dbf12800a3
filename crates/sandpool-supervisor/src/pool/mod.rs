//! Worker pool: lifecycle, acquisition, recycling, crash recovery.
//!
//! # Components
//!
//! - [`Pool`]: owns the warm workers and serves `compute()` callers
//! - `WorkerHandle`: per-subprocess state and termination logic
//! - [`PoolEvent`]: lifecycle notifications for observers
//!
//! # Task Flow
//!
//! 1. Caller submits a [`ComputeTask`] via [`Pool::compute`]
//! 2. A ready worker is taken from the front of the FIFO ring
//! 3. A fresh socket connection carries one request and one response
//! 4. A healthy worker returns to the back of the ring

mod events;
mod handle;
mod manager;

pub use events::PoolEvent;
pub use manager::Pool;

use std::time::Duration;

use serde_json::Value;

/// One unit of work: which module to run, with what input, for how long.
///
/// Created by the caller, consumed once.
#[derive(Debug, Clone)]
pub struct ComputeTask {
    /// URL of the compute module, resolved by the worker's module loader.
    pub module_url: String,
    /// JSON value handed to the module's compute entry point.
    pub params: Value,
    /// Deadline for the whole exchange with the worker.
    pub timeout: Duration,
}

impl ComputeTask {
    /// Create a task.
    pub fn new(module_url: impl Into<String>, params: Value, timeout: Duration) -> Self {
        Self {
            module_url: module_url.into(),
            params,
            timeout,
        }
    }
}
