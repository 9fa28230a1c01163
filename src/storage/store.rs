//! SQLite-backed job store.
//!
//! The store is the durable repository of jobs and queue configuration and
//! the sole arbiter of job claims. Jobs double as work items and locks: the
//! `lock_holder`/`lock_time` pair marks exclusive, time-bounded ownership of
//! a job by one worker.
//!
//! # Claim protocol
//!
//! `claim_next` selects and locks the next eligible job in a single SQL
//! `UPDATE ... WHERE id = (SELECT ...) RETURNING` statement. SQLite
//! serializes writers, so the eligibility check and the lock write are one
//! atomic unit and two concurrent claimers can never be handed the same job.
//! Leases are renewed by their holder while a job executes; a lease that is
//! both expired and unrenewed is presumed abandoned and may be reclaimed by
//! any worker.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;

use crate::queue::job::{
    generate_job_id, Job, JobSpec, JobState, DEFAULT_BACKOFF_BASE, DEFAULT_MAX_RETRIES,
};

use super::migrations::{MigrationError, MigrationRunner};

/// Default staleness threshold: a lease untouched for this long is
/// presumed abandoned and becomes reclaimable.
pub const DEFAULT_STALE_AFTER: StdDuration = StdDuration::from_secs(5 * 60);

/// Recognized configuration keys.
pub mod config_keys {
    /// Attempts allowed before a job moves to the dead letter queue.
    pub const MAX_RETRIES: &str = "max-retries";
    /// Base of the exponential retry backoff, in seconds.
    pub const BACKOFF_BASE: &str = "backoff-base";
}

const RECOGNIZED_CONFIG_KEYS: [&str; 2] = [config_keys::MAX_RETRIES, config_keys::BACKOFF_BASE];

/// Column list shared by every query that reads back full job rows.
const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, created_at, updated_at, \
                           next_retry_at, error_message, lock_holder, lock_time";

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Malformed enqueue input.
    #[error("Invalid job: {0}")]
    Validation(String),

    /// A job with the supplied id already exists.
    #[error("Job '{0}' already exists")]
    DuplicateId(String),

    /// No job with the given id.
    #[error("Job '{0}' not found")]
    NotFound(String),

    /// The job is not in the state the operation requires.
    #[error("Job '{id}' is {state}, not {expected}")]
    InvalidState {
        /// Id of the offending job.
        id: String,
        /// State the job is actually in.
        state: JobState,
        /// State the operation requires.
        expected: JobState,
    },

    /// Unrecognized configuration key or invalid value.
    #[error("Invalid config: {0}")]
    Config(String),

    /// Failed to open the database.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// A stored state string no longer parses; the database is corrupt.
    #[error("Unknown job state '{0}' in store")]
    UnknownState(String),
}

/// Counts of jobs per lifecycle state.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueStats {
    /// Jobs waiting to be claimed.
    pub pending: u64,
    /// Jobs currently held by a worker.
    pub processing: u64,
    /// Jobs that finished successfully.
    pub completed: u64,
    /// Jobs waiting out a retry backoff.
    pub failed: u64,
    /// Jobs in the dead letter queue.
    pub dead: u64,
}

impl QueueStats {
    /// Returns the total number of jobs in the store.
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.dead
    }
}

/// Partial update applied to a stored job.
///
/// Unset fields are left untouched; `updated_at` is always stamped.
/// `lock_holder` and `lock_time` are set and cleared together.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    state: Option<JobState>,
    attempts: Option<u32>,
    next_retry_at: Option<Option<DateTime<Utc>>>,
    error_message: Option<Option<String>>,
    lock: Option<Option<(String, DateTime<Utc>)>>,
}

impl JobUpdate {
    /// Creates an empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the job state.
    pub fn state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    /// Sets the attempt counter.
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    /// Sets the retry eligibility time.
    pub fn next_retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_retry_at = Some(Some(at));
        self
    }

    /// Clears the retry eligibility time.
    pub fn clear_next_retry(mut self) -> Self {
        self.next_retry_at = Some(None);
        self
    }

    /// Sets the last failure reason.
    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(Some(message.into()));
        self
    }

    /// Clears the last failure reason.
    pub fn clear_error(mut self) -> Self {
        self.error_message = Some(None);
        self
    }

    /// Grants the lease to `holder` as of `time`.
    pub fn lock(mut self, holder: impl Into<String>, time: DateTime<Utc>) -> Self {
        self.lock = Some(Some((holder.into(), time)));
        self
    }

    /// Releases the lease.
    pub fn clear_lock(mut self) -> Self {
        self.lock = Some(None);
        self
    }
}

/// SQLite-backed repository of jobs and configuration.
pub struct JobStore {
    pool: SqlitePool,
    stale_after: StdDuration,
}

impl JobStore {
    /// Opens (creating if necessary) the database at `path` and runs
    /// migrations. The parent directory is created when missing.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::ConnectionFailed(format!(
                        "cannot create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(StdDuration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let store = Self::from_pool(pool);
        store.run_migrations().await?;

        Ok(store)
    }

    /// Creates a store from an existing pool.
    ///
    /// Useful when sharing a connection pool across multiple components.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    /// Overrides the lease staleness threshold.
    pub fn with_stale_after(mut self, stale_after: StdDuration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs database migrations, seeding default configuration.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let runner = MigrationRunner::new(self.pool.clone());
        runner.run_migrations().await?;
        Ok(())
    }

    // =========================================================================
    // Job Operations
    // =========================================================================

    /// Creates a new pending job from `spec`.
    ///
    /// When `spec.id` is omitted a fresh UUID is generated; when
    /// `spec.max_retries` is omitted the configured `max-retries` value is
    /// captured into the job at creation time.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Validation` for an empty command or a zero
    /// retry budget, and `StoreError::DuplicateId` when the caller-supplied
    /// id already exists.
    pub async fn create(&self, spec: JobSpec) -> Result<Job, StoreError> {
        if spec.command.trim().is_empty() {
            return Err(StoreError::Validation("job command is required".to_string()));
        }
        if spec.max_retries == Some(0) {
            return Err(StoreError::Validation(
                "max_retries must be at least 1".to_string(),
            ));
        }

        let max_retries = match spec.max_retries {
            Some(n) => n,
            None => self.default_max_retries().await?,
        };

        let now = Utc::now();
        let job = Job {
            id: spec.id.unwrap_or_else(generate_job_id),
            command: spec.command,
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            next_retry_at: None,
            error_message: None,
            lock_holder: None,
            lock_time: None,
        };

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, command, state, attempts, max_retries, created_at, updated_at,
                next_retry_at, error_message, lock_holder, lock_time
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(job.attempts as i64)
        .bind(job.max_retries as i64)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.next_retry_at)
        .bind(&job.error_message)
        .bind(&job.lock_holder)
        .bind(job.lock_time)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            if e.as_database_error()
                .map_or(false, |db| db.is_unique_violation())
            {
                return Err(StoreError::DuplicateId(job.id));
            }
            return Err(StoreError::Database(e));
        }

        Ok(job)
    }

    /// Retrieves a job by id.
    pub async fn get(&self, id: &str) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    /// Lists jobs, optionally filtered by state, most recent first.
    /// Ties on `created_at` are broken by id so the order is stable.
    pub async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, StoreError> {
        let rows = match state {
            Some(state) => {
                sqlx::query(&format!(
                    "SELECT {} FROM jobs WHERE state = ? ORDER BY created_at DESC, id ASC",
                    JOB_COLUMNS
                ))
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM jobs ORDER BY created_at DESC, id ASC",
                    JOB_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(job_from_row).collect()
    }

    /// Applies a partial update to a job, stamping `updated_at`.
    pub async fn update(&self, id: &str, update: JobUpdate) -> Result<Job, StoreError> {
        let mut sets: Vec<&str> = vec!["updated_at = ?"];
        if update.state.is_some() {
            sets.push("state = ?");
        }
        if update.attempts.is_some() {
            sets.push("attempts = ?");
        }
        if update.next_retry_at.is_some() {
            sets.push("next_retry_at = ?");
        }
        if update.error_message.is_some() {
            sets.push("error_message = ?");
        }
        if update.lock.is_some() {
            sets.push("lock_holder = ?");
            sets.push("lock_time = ?");
        }

        let sql = format!("UPDATE jobs SET {} WHERE id = ?", sets.join(", "));
        let mut query = sqlx::query(&sql).bind(Utc::now());

        if let Some(state) = update.state {
            query = query.bind(state.as_str());
        }
        if let Some(attempts) = update.attempts {
            query = query.bind(attempts as i64);
        }
        if let Some(next_retry_at) = update.next_retry_at {
            query = query.bind(next_retry_at);
        }
        if let Some(error_message) = update.error_message {
            query = query.bind(error_message);
        }
        if let Some(lock) = update.lock {
            let (holder, time) = match lock {
                Some((holder, time)) => (Some(holder), Some(time)),
                None => (None, None),
            };
            query = query.bind(holder).bind(time);
        }

        let result = query.bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        self.get(id).await
    }

    /// Deletes a job.
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        Ok(())
    }

    // =========================================================================
    // Claim / Lease Protocol
    // =========================================================================

    /// Claims the next eligible job for `worker_id`, oldest first.
    ///
    /// A job is eligible when it is pending, when it is failed and its
    /// retry time has arrived, or when its lease has gone stale (untouched
    /// for longer than the staleness threshold) regardless of state. The
    /// matched job is transitioned to `processing` with the lease granted
    /// to `worker_id`; the selection and the lock write are one atomic
    /// statement.
    ///
    /// Reclaiming a stale lease charges no attempt and records no error:
    /// the job resumes as if freshly claimed.
    pub async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let stale_cutoff = now - Duration::seconds(self.stale_after.as_secs() as i64);

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = 'processing',
                lock_holder = ?,
                lock_time = ?,
                updated_at = ?,
                next_retry_at = NULL
            WHERE id = (
                SELECT id FROM jobs
                WHERE (lock_holder IS NULL
                       AND (state = 'pending'
                            OR (state = 'failed'
                                AND next_retry_at IS NOT NULL
                                AND next_retry_at <= ?)))
                   OR (lock_holder IS NOT NULL AND lock_time < ?)
                ORDER BY created_at ASC, id ASC
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(worker_id)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(stale_cutoff)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// Extends the lease on `id`, provided `worker_id` still holds it.
    ///
    /// Returns `false` when the lease has been lost (reclaimed by another
    /// worker, or the job was finalized elsewhere).
    pub async fn renew_lease(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET lock_time = ?, updated_at = ? \
             WHERE id = ? AND lock_holder = ? AND state = 'processing'",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Clears the lease on a job without changing its state.
    ///
    /// Used when a worker voluntarily abandons a job.
    pub async fn release(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET lock_holder = NULL, lock_time = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        Ok(())
    }

    // =========================================================================
    // Dead Letter Queue
    // =========================================================================

    /// Resets a dead job to pending: attempts, error and lease cleared.
    ///
    /// Returns `None` when the job exists but is not dead (or does not
    /// exist); the check and the reset are one conditional statement.
    pub async fn requeue_dead(&self, id: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = 'pending',
                attempts = 0,
                next_retry_at = NULL,
                error_message = NULL,
                lock_holder = NULL,
                lock_time = NULL,
                updated_at = ?
            WHERE id = ? AND state = 'dead'
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// Resets every dead job to pending, returning how many were requeued.
    pub async fn requeue_all_dead(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending',
                attempts = 0,
                next_retry_at = NULL,
                error_message = NULL,
                lock_holder = NULL,
                lock_time = NULL,
                updated_at = ?
            WHERE state = 'dead'
            "#,
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Returns counts of jobs per state.
    pub async fn stats(&self) -> Result<QueueStats, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let state: String = row.get("state");
            let count: i64 = row.get("count");
            match state.parse::<JobState>() {
                Ok(JobState::Pending) => stats.pending = count as u64,
                Ok(JobState::Processing) => stats.processing = count as u64,
                Ok(JobState::Completed) => stats.completed = count as u64,
                Ok(JobState::Failed) => stats.failed = count as u64,
                Ok(JobState::Dead) => stats.dead = count as u64,
                Err(_) => return Err(StoreError::UnknownState(state)),
            }
        }

        Ok(stats)
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Reads a configuration value. Returns `None` for keys never set.
    pub async fn get_config(&self, key: &str) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("value")))
    }

    /// Returns all configuration values, ordered by key.
    pub async fn all_config(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        let rows = sqlx::query("SELECT key, value FROM config ORDER BY key")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("key"), r.get::<i64, _>("value")))
            .collect())
    }

    /// Sets a configuration value.
    ///
    /// Only affects jobs enqueued or retried after the change; jobs already
    /// carrying a `max_retries` value keep it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Config` for an unrecognized key or a negative
    /// value.
    pub async fn set_config(&self, key: &str, value: i64) -> Result<(), StoreError> {
        if !RECOGNIZED_CONFIG_KEYS.contains(&key) {
            return Err(StoreError::Config(format!(
                "unrecognized key '{}', valid keys: {}",
                key,
                RECOGNIZED_CONFIG_KEYS.join(", ")
            )));
        }
        if value < 0 {
            return Err(StoreError::Config(format!(
                "value for '{}' must be a non-negative integer",
                key
            )));
        }

        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// The retry budget given to jobs that don't specify one.
    /// Clamped to at least one attempt.
    pub async fn default_max_retries(&self) -> Result<u32, StoreError> {
        let value = self
            .get_config(config_keys::MAX_RETRIES)
            .await?
            .unwrap_or(DEFAULT_MAX_RETRIES as i64);
        Ok((value.max(1)) as u32)
    }

    /// The configured exponential backoff base, in seconds.
    pub async fn backoff_base(&self) -> Result<u32, StoreError> {
        let value = self
            .get_config(config_keys::BACKOFF_BASE)
            .await?
            .unwrap_or(DEFAULT_BACKOFF_BASE as i64);
        Ok(value.max(0) as u32)
    }
}

/// Decodes a full job row.
fn job_from_row(row: &SqliteRow) -> Result<Job, StoreError> {
    let state_raw: String = row.get("state");
    let state = state_raw
        .parse::<JobState>()
        .map_err(|_| StoreError::UnknownState(state_raw))?;

    let attempts: i64 = row.get("attempts");
    let max_retries: i64 = row.get("max_retries");

    Ok(Job {
        id: row.get("id"),
        command: row.get("command"),
        state,
        attempts: attempts as u32,
        max_retries: max_retries as u32,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        next_retry_at: row.get("next_retry_at"),
        error_message: row.get("error_message"),
        lock_holder: row.get("lock_holder"),
        lock_time: row.get("lock_time"),
    })
}
