//! SQLite persistent storage.
//!
//! This module provides the durable side of the queue:
//! - **JobStore**: repository of jobs and configuration, and the sole
//!   arbiter of job claims (the lease protocol lives here)
//! - **Migrations**: idempotent schema management
//!
//! Jobs and configuration both survive process restarts; workers in the
//! same or different processes coordinate purely through store state.
//!
//! # Usage
//!
//! ```rust,ignore
//! use queuectl::storage::JobStore;
//! use queuectl::queue::JobSpec;
//! use chrono::Utc;
//!
//! let store = JobStore::open("data/queuectl.db").await?;
//!
//! let job = store.create(JobSpec::new("tar czf backup.tgz /srv")).await?;
//!
//! // Workers race for jobs through the atomic claim
//! if let Some(job) = store.claim_next("worker-1", Utc::now()).await? {
//!     // run it...
//! }
//! ```

pub mod migrations;
pub mod schema;
pub mod store;

// Re-export main types for convenience
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};
pub use store::{config_keys, JobStore, JobUpdate, QueueStats, StoreError, DEFAULT_STALE_AFTER};
