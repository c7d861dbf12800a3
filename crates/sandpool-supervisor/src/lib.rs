//! Sandpool Supervisor Library
//!
//! Host-side half of Sandpool:
//! - Warm pool of worker subprocesses, one Unix socket each
//! - Task routing with per-task deadlines and FIFO acquisition
//! - Worker recycling after a configured task count
//! - Crash detection, bounded retries, background repopulation
//! - Clean shutdown without orphaned processes or leaked sockets

pub mod error;
pub mod pool;

pub use error::PoolError;
pub use pool::{ComputeTask, Pool, PoolEvent};
pub use sandpool_core::PoolConfig;
