//! Background job queue with worker pools.
//!
//! This module contains the job lifecycle and everything that drives it:
//!
//! - **Job**: job definitions with retry bookkeeping and backoff arithmetic
//! - **JobQueue**: the queue facade - enqueue, claim, finalize, DLQ and
//!   configuration operations over a shared store
//! - **WorkerPool**: pool of workers that execute jobs concurrently
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │    (CLI)     │
//!                      └──────┬───────┘
//!                             │ enqueue
//!                      ┌──────▼───────┐
//!                      │   JobStore   │
//!                      │   (SQLite)   │
//!                      └──────┬───────┘
//!                             │ claim / finalize
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use queuectl::queue::{JobQueue, JobSpec, WorkerPool, WorkerPoolConfig};
//! use queuectl::storage::JobStore;
//! use std::sync::Arc;
//!
//! let store = Arc::new(JobStore::open("data/queuectl.db").await?);
//! let queue = JobQueue::new(store);
//!
//! queue.enqueue(JobSpec::new("rsync -a /srv backup:/srv")).await?;
//!
//! let mut pool = WorkerPool::new(WorkerPoolConfig::new(4), queue.clone());
//! pool.start()?;
//!
//! // Graceful shutdown: workers finish their current jobs
//! pool.shutdown().await?;
//! ```
//!
//! # Reliability
//!
//! - **Atomic claim**: eligibility check and lock write are one SQL
//!   statement, so two workers can never hold the same job
//! - **Renewable leases**: executing workers heartbeat their lease; only
//!   leases that are both expired and unrenewed are reclaimed
//! - **Dead letter queue**: jobs that exhaust their retry budget are
//!   parked for inspection and manual requeue
//! - **At-least-once**: a crash between command completion and
//!   finalization re-runs the command; exactly-once is not guaranteed

pub mod job;
pub mod manager;
pub mod worker;
pub mod worker_pool;

// Re-export main types for convenience
pub use job::{
    backoff_delay_secs, next_retry_time, Job, JobSpec, JobState, ParseJobStateError,
    DEFAULT_BACKOFF_BASE, DEFAULT_MAX_RETRIES,
};
pub use manager::{FailOutcome, JobQueue};
pub use worker::Worker;
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
