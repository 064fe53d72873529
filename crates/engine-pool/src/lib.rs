//! C4: the process pool manager.

pub mod config;
pub mod pool;
pub mod worker_handle;

pub use config::PoolConfig;
pub use pool::{PoolError, PoolStats, ProcessPool, TerminalEvent};
pub use worker_handle::{WorkerHandle, WorkerHandleError, WorkerState};
