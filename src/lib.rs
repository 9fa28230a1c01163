//! queuectl: CLI-based background job queue.
//!
//! Clients enqueue shell commands as jobs; a pool of workers claims jobs,
//! executes them as subprocesses and applies retry-with-backoff or
//! dead-letter semantics on failure.

// Core modules
pub mod cli;
pub mod queue;
pub mod storage;

// Re-export commonly used types
pub use queue::{
    FailOutcome, Job, JobQueue, JobSpec, JobState, PoolError, PoolStats, Worker, WorkerPool,
    WorkerPoolConfig,
};
pub use storage::{JobStore, QueueStats, StoreError};
