//! Job definitions for the queue.
//!
//! This module defines the core job types:
//!
//! - `Job`: a shell command tracked through the retry lifecycle
//! - `JobSpec`: caller-supplied description of a job to enqueue
//! - `JobState`: the lifecycle states
//!
//! plus the backoff arithmetic shared by the store and the workers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default maximum number of attempts before a job is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default exponential backoff base, in seconds.
pub const DEFAULT_BACKOFF_BASE: u32 = 2;

/// Lifecycle states of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting to be claimed by a worker.
    Pending,
    /// Claimed and executing under a lease.
    Processing,
    /// Finished successfully.
    Completed,
    /// Failed, waiting out a retry backoff.
    Failed,
    /// Retries exhausted; parked in the dead letter queue.
    Dead,
}

impl JobState {
    /// The lowercase name used on the wire and in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unrecognized state name.
#[derive(Debug, Clone, Error)]
#[error("unknown job state '{0}'")]
pub struct ParseJobStateError(String);

impl FromStr for JobState {
    type Err = ParseJobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(ParseJobStateError(other.to_string())),
        }
    }
}

/// A shell command tracked by the queue.
///
/// The record doubles as work item and lock: `lock_holder`/`lock_time`
/// are set together when a worker claims the job and cleared together
/// when the claim ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, caller-assigned or generated.
    pub id: String,
    /// The shell command to execute.
    pub command: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Times execution has been tried and failed.
    pub attempts: u32,
    /// Attempts allowed before moving to the dead letter queue.
    pub max_retries: u32,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
    /// Advances on every mutation.
    pub updated_at: DateTime<Utc>,
    /// When a failed job becomes eligible for retry. Set only while failed.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Last failure reason; cleared on success or dead-letter reset.
    pub error_message: Option<String>,
    /// Worker currently holding the lease, if any.
    pub lock_holder: Option<String>,
    /// When the lease was granted or last renewed.
    pub lock_time: Option<DateTime<Utc>>,
}

impl Job {
    /// Returns whether the retry budget is spent.
    ///
    /// `attempts >= max_retries` is precisely the condition that forces a
    /// failing job into the dead letter queue.
    pub fn has_exhausted_retries(&self) -> bool {
        self.attempts >= self.max_retries
    }

    /// Returns the number of remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_retries.saturating_sub(self.attempts)
    }

    /// Returns whether a worker currently holds the lease.
    pub fn is_locked(&self) -> bool {
        self.lock_holder.is_some()
    }
}

/// Specification of a job to enqueue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    /// Explicit job id. Generated when omitted.
    #[serde(default)]
    pub id: Option<String>,
    /// The shell command to execute. Required, non-empty.
    pub command: String,
    /// Retry budget. Falls back to the configured `max-retries` value.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl JobSpec {
    /// Creates a spec for `command` with defaults for everything else.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: None,
            command: command.into(),
            max_retries: None,
        }
    }

    /// Sets an explicit job id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Generates a fresh job identifier.
pub(crate) fn generate_job_id() -> String {
    Uuid::new_v4().to_string()
}

/// Exponential backoff delay after `attempts` failed executions.
///
/// `delay = base ^ attempts` seconds. Pure arithmetic on the inputs, so a
/// retry schedule is reproducible from `(attempts, base)` alone.
pub fn backoff_delay_secs(attempts: u32, base: u32) -> u64 {
    (base as u64).saturating_pow(attempts)
}

/// The instant at which a job that has now failed `attempts` times
/// becomes eligible for retry.
pub fn next_retry_time(now: DateTime<Utc>, attempts: u32, base: u32) -> DateTime<Utc> {
    let delay = backoff_delay_secs(attempts, base).min(i64::MAX as u64);
    now + Duration::seconds(delay as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_delay_values() {
        assert_eq!(backoff_delay_secs(1, 2), 2);
        assert_eq!(backoff_delay_secs(3, 2), 8);
        assert_eq!(backoff_delay_secs(0, 3), 1);
        assert_eq!(backoff_delay_secs(4, 3), 81);
    }

    #[test]
    fn test_backoff_delay_saturates() {
        assert_eq!(backoff_delay_secs(500, 10), u64::MAX);
    }

    #[test]
    fn test_next_retry_time_offsets_now() {
        let now = Utc::now();
        assert_eq!(next_retry_time(now, 1, 2), now + Duration::seconds(2));
        assert_eq!(next_retry_time(now, 3, 2), now + Duration::seconds(8));
    }

    #[test]
    fn test_state_display_and_parse() {
        for state in [
            JobState::Pending,
            JobState::Processing,
            JobState::Completed,
            JobState::Failed,
            JobState::Dead,
        ] {
            assert_eq!(state.to_string().parse::<JobState>().unwrap(), state);
        }

        assert!("zombie".parse::<JobState>().is_err());
    }

    #[test]
    fn test_job_spec_builder() {
        let spec = JobSpec::new("echo hello")
            .with_id("job-1")
            .with_max_retries(5);

        assert_eq!(spec.command, "echo hello");
        assert_eq!(spec.id.as_deref(), Some("job-1"));
        assert_eq!(spec.max_retries, Some(5));
    }

    #[test]
    fn test_retry_budget_helpers() {
        let mut job = Job {
            id: "j1".to_string(),
            command: "echo hi".to_string(),
            state: JobState::Pending,
            attempts: 0,
            max_retries: 2,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            next_retry_at: None,
            error_message: None,
            lock_holder: None,
            lock_time: None,
        };

        assert!(!job.has_exhausted_retries());
        assert_eq!(job.remaining_attempts(), 2);

        job.attempts = 2;
        assert!(job.has_exhausted_retries());
        assert_eq!(job.remaining_attempts(), 0);
    }
}
