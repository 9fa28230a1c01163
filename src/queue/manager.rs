//! Queue facade over the job store.
//!
//! `JobQueue` is the core-facing interface consumed by the CLI and the
//! workers. It owns the lifecycle transitions: finalizing executions into
//! completed/failed/dead, reverting shutdown-interrupted jobs, and moving
//! jobs out of the dead letter queue.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::storage::{JobStore, JobUpdate, QueueStats, StoreError};

use super::job::{next_retry_time, Job, JobSpec, JobState};

/// Result of finalizing a failed execution.
#[derive(Debug, Clone)]
pub enum FailOutcome {
    /// The job was rescheduled; `job.next_retry_at` carries the backoff.
    Retrying {
        /// The job as stored after the transition.
        job: Job,
    },
    /// The retry budget is spent; the job moved to the dead letter queue.
    Dead {
        /// The job as stored after the transition.
        job: Job,
    },
}

/// Facade exposing queue operations over a shared store.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<JobStore>,
}

impl JobQueue {
    /// Creates a queue over `store`.
    pub fn new(store: Arc<JobStore>) -> Self {
        Self { store }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Enqueues a new pending job.
    pub async fn enqueue(&self, spec: JobSpec) -> Result<Job, StoreError> {
        let job = self.store.create(spec).await?;
        debug!(job_id = %job.id, command = %job.command, "job enqueued");
        Ok(job)
    }

    /// Claims the next eligible job for `worker_id`, if any.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Job>, StoreError> {
        self.store.claim_next(worker_id, Utc::now()).await
    }

    /// Extends the lease `worker_id` holds on a job.
    pub async fn renew_lease(&self, job_id: &str, worker_id: &str) -> Result<bool, StoreError> {
        self.store.renew_lease(job_id, worker_id, Utc::now()).await
    }

    /// Finalizes a successful execution: completed, lease and error cleared.
    pub async fn complete(&self, job_id: &str) -> Result<(), StoreError> {
        self.store
            .update(
                job_id,
                JobUpdate::new()
                    .state(JobState::Completed)
                    .clear_error()
                    .clear_next_retry()
                    .clear_lock(),
            )
            .await?;
        Ok(())
    }

    /// Finalizes a failed execution.
    ///
    /// Charges an attempt and records `message`. While the retry budget
    /// holds, the job is rescheduled `backoff-base ^ attempts` seconds out;
    /// once `attempts` reaches `max_retries` it moves to the dead letter
    /// queue. The backoff base is read at failure time, so configuration
    /// changes apply to subsequent retries.
    pub async fn fail(&self, job_id: &str, message: &str) -> Result<FailOutcome, StoreError> {
        let job = self.store.get(job_id).await?;
        let attempts = job.attempts + 1;

        if attempts >= job.max_retries {
            let job = self
                .store
                .update(
                    job_id,
                    JobUpdate::new()
                        .state(JobState::Dead)
                        .attempts(attempts)
                        .error_message(message)
                        .clear_next_retry()
                        .clear_lock(),
                )
                .await?;
            Ok(FailOutcome::Dead { job })
        } else {
            let base = self.store.backoff_base().await?;
            let job = self
                .store
                .update(
                    job_id,
                    JobUpdate::new()
                        .state(JobState::Failed)
                        .attempts(attempts)
                        .error_message(message)
                        .next_retry_at(next_retry_time(Utc::now(), attempts, base))
                        .clear_lock(),
                )
                .await?;
            Ok(FailOutcome::Retrying { job })
        }
    }

    /// Reverts a claimed-but-unfinalized job to pending.
    ///
    /// Used when a worker is stopped mid-job: no attempt is charged and no
    /// error is recorded, distinguishing "interrupted by shutdown" from
    /// "failed execution".
    pub async fn return_to_queue(&self, job_id: &str) -> Result<(), StoreError> {
        self.store
            .update(
                job_id,
                JobUpdate::new().state(JobState::Pending).clear_lock(),
            )
            .await?;
        Ok(())
    }

    /// Retrieves a job by id.
    pub async fn get(&self, job_id: &str) -> Result<Job, StoreError> {
        self.store.get(job_id).await
    }

    /// Lists jobs, optionally filtered by state, most recent first.
    pub async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, StoreError> {
        self.store.list(state).await
    }

    /// Removes a job from the store.
    pub async fn remove(&self, job_id: &str) -> Result<(), StoreError> {
        self.store.delete(job_id).await
    }

    /// Lists the dead letter queue, most recent first.
    pub async fn dead_letter_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.store.list(Some(JobState::Dead)).await
    }

    /// Moves a dead job back to pending with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` for an unknown id, `StoreError::InvalidState`
    /// when the job exists but is not dead.
    pub async fn retry_from_dlq(&self, job_id: &str) -> Result<Job, StoreError> {
        if let Some(job) = self.store.requeue_dead(job_id).await? {
            return Ok(job);
        }

        // Nothing matched: tell the caller whether the job is missing or
        // simply not dead
        let job = self.store.get(job_id).await?;
        Err(StoreError::InvalidState {
            id: job_id.to_string(),
            state: job.state,
            expected: JobState::Dead,
        })
    }

    /// Moves every dead job back to pending, returning the count.
    pub async fn retry_all_from_dlq(&self) -> Result<u64, StoreError> {
        self.store.requeue_all_dead().await
    }

    /// Returns counts of jobs per state.
    pub async fn stats(&self) -> Result<QueueStats, StoreError> {
        self.store.stats().await
    }

    /// Reads a configuration value.
    pub async fn get_config(&self, key: &str) -> Result<Option<i64>, StoreError> {
        self.store.get_config(key).await
    }

    /// Returns all configuration values, ordered by key.
    pub async fn all_config(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        self.store.all_config().await
    }

    /// Sets a configuration value.
    pub async fn set_config(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.store.set_config(key, value).await
    }
}
