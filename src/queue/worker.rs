//! Worker execution loop.
//!
//! A worker repeatedly claims the next eligible job, executes its command
//! as a child process through the platform shell (inheriting the caller's
//! standard streams), and finalizes the outcome: exit code 0 completes the
//! job, anything else - including a spawn failure - drives the retry/DLQ
//! transition.
//!
//! Stops are cooperative and non-preemptive. An in-flight subprocess is
//! never killed; once it terminates, a worker that has observed a stop
//! request returns the job to the queue unfinalized (pending, no attempt
//! charged) instead of claiming further work. A crash or stop between
//! command completion and finalization can therefore re-run a command:
//! execution is at-least-once by design.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::manager::{FailOutcome, JobQueue};
use super::worker_pool::SharedPoolStats;
use crate::queue::job::Job;

/// A single worker processing jobs from the shared store.
pub struct Worker {
    /// Unique identifier, used as the lease holder name.
    id: String,
    /// Queue facade shared with the rest of the pool.
    queue: JobQueue,
    /// Receiver for the pool's shutdown broadcast.
    shutdown_rx: broadcast::Receiver<()>,
    /// Latched once a stop request has been observed.
    stop: bool,
    /// Idle wait between polls when no job is eligible.
    poll_interval: Duration,
    /// How often the lease is renewed while a job executes.
    heartbeat_interval: Duration,
    /// Shared statistics.
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    /// Creates a new worker.
    pub(crate) fn new(
        id: String,
        queue: JobQueue,
        shutdown_rx: broadcast::Receiver<()>,
        poll_interval: Duration,
        heartbeat_interval: Duration,
        stats: Arc<SharedPoolStats>,
    ) -> Self {
        Self {
            id,
            queue,
            shutdown_rx,
            stop: false,
            poll_interval,
            heartbeat_interval,
            stats,
        }
    }

    /// Main worker loop.
    ///
    /// Continuously claims and processes jobs until a stop request is
    /// observed.
    pub(crate) async fn run(mut self) {
        info!(worker_id = %self.id, "worker started");

        loop {
            if self.shutdown_requested() {
                break;
            }

            match self.queue.claim(&self.id).await {
                Ok(Some(job)) => self.process_job(job).await,
                Ok(None) => {
                    debug!(worker_id = %self.id, "no jobs available");
                    self.idle_wait().await;
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "failed to claim job");
                    self.idle_wait().await;
                }
            }
        }

        info!(worker_id = %self.id, "worker stopped");
    }

    /// Executes one claimed job and writes the outcome back.
    async fn process_job(&mut self, job: Job) {
        info!(
            worker_id = %self.id,
            job_id = %job.id,
            command = %job.command,
            attempt = job.attempts + 1,
            "processing job"
        );

        self.stats.increment_active();
        let heartbeat = self.spawn_lease_heartbeat(&job.id);

        let start = Instant::now();
        let outcome = execute_command(&job.command).await;
        let duration = start.elapsed();

        heartbeat.abort();
        self.stats.decrement_active();

        if self.shutdown_requested() {
            // A stop arrived while the command ran. The subprocess has
            // terminated either way; hand the claim back with no attempt
            // charged rather than finalizing.
            match self.queue.return_to_queue(&job.id).await {
                Ok(()) => warn!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    "stop requested mid-job, job returned to queue"
                ),
                Err(e) => error!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    error = %e,
                    "failed to return job to queue"
                ),
            }
            return;
        }

        match outcome {
            Ok(status) if status.success() => match self.queue.complete(&job.id).await {
                Ok(()) => {
                    self.stats.record_success(duration);
                    info!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        duration_ms = duration.as_millis() as u64,
                        "job completed"
                    );
                }
                Err(e) => error!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    error = %e,
                    "failed to mark job complete"
                ),
            },
            Ok(status) => {
                self.finalize_failure(&job, describe_exit(status), duration)
                    .await;
            }
            Err(e) => {
                // Spawn failures are captured into the job, not propagated:
                // for retry purposes they are the same as a non-zero exit
                self.finalize_failure(&job, format!("failed to spawn command: {}", e), duration)
                    .await;
            }
        }
    }

    /// Drives the retry/DLQ transition for a failed execution.
    async fn finalize_failure(&self, job: &Job, message: String, duration: Duration) {
        self.stats.record_failure(duration);

        match self.queue.fail(&job.id, &message).await {
            Ok(FailOutcome::Retrying { job }) => warn!(
                worker_id = %self.id,
                job_id = %job.id,
                attempt = job.attempts,
                max_retries = job.max_retries,
                error = %message,
                "job failed, retry scheduled"
            ),
            Ok(FailOutcome::Dead { job }) => error!(
                worker_id = %self.id,
                job_id = %job.id,
                attempts = job.attempts,
                error = %message,
                "job failed, moved to dead letter queue"
            ),
            Err(e) => error!(
                worker_id = %self.id,
                job_id = %job.id,
                error = %e,
                "failed to record job failure"
            ),
        }
    }

    /// Renews the lease on `job_id` on a fixed interval for as long as the
    /// returned task is alive. Aborted by the caller once execution ends.
    fn spawn_lease_heartbeat(&self, job_id: &str) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let worker_id = self.id.clone();
        let job_id = job_id.to_string();
        let period = self.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; skip it
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match queue.renew_lease(&job_id, &worker_id).await {
                    Ok(true) => debug!(worker_id = %worker_id, job_id = %job_id, "lease renewed"),
                    Ok(false) => {
                        warn!(
                            worker_id = %worker_id,
                            job_id = %job_id,
                            "lease no longer held, stopping renewal"
                        );
                        break;
                    }
                    Err(e) => warn!(
                        worker_id = %worker_id,
                        job_id = %job_id,
                        error = %e,
                        "lease renewal failed"
                    ),
                }
            }
        })
    }

    /// Returns whether a stop has been requested, latching the result.
    fn shutdown_requested(&mut self) -> bool {
        if self.stop {
            return true;
        }

        match self.shutdown_rx.try_recv() {
            Ok(()) | Err(broadcast::error::TryRecvError::Closed) => self.stop = true,
            // Shutdown is the only message ever sent, so lagging behind
            // still means one was sent
            Err(broadcast::error::TryRecvError::Lagged(_)) => self.stop = true,
            Err(broadcast::error::TryRecvError::Empty) => {}
        }

        self.stop
    }

    /// Sleeps out the poll interval, waking early on shutdown.
    async fn idle_wait(&mut self) {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = self.shutdown_rx.recv() => {
                self.stop = true;
            }
        }
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Runs `command` through the platform shell, inheriting the caller's
/// standard streams, and waits for it to terminate.
async fn execute_command(command: &str) -> std::io::Result<ExitStatus> {
    shell_command(command).status().await
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd.exe");
    cmd.arg("/C").arg(command);
    cmd
}

/// Human-readable description of a non-success exit.
fn describe_exit(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("command exited with code {}", code),
        None => "command terminated by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::{JobSpec, JobState};
    use crate::storage::JobStore;

    async fn test_queue() -> (tempfile::TempDir, JobQueue) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let store = JobStore::open(dir.path().join("queue.db"))
            .await
            .expect("open store");
        (dir, JobQueue::new(Arc::new(store)))
    }

    fn spawn_worker(queue: &JobQueue) -> (broadcast::Sender<()>, JoinHandle<()>) {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = Worker::new(
            "worker-test".to_string(),
            queue.clone(),
            shutdown_rx,
            Duration::from_millis(20),
            Duration::from_secs(60),
            Arc::new(SharedPoolStats::new()),
        );
        (shutdown_tx, tokio::spawn(worker.run()))
    }

    async fn wait_for_state(queue: &JobQueue, id: &str, state: JobState) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let job = queue.get(id).await.expect("job should exist");
            if job.state == state {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "job '{}' stuck in {:?}, wanted {:?}",
                id,
                job.state,
                state
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_completes_and_dead_letters() {
        let (_dir, queue) = test_queue().await;

        queue
            .enqueue(JobSpec::new("exit 0").with_id("ok"))
            .await
            .expect("enqueue");
        queue
            .enqueue(JobSpec::new("exit 7").with_id("bad").with_max_retries(1))
            .await
            .expect("enqueue");

        let (shutdown_tx, handle) = spawn_worker(&queue);

        wait_for_state(&queue, "ok", JobState::Completed).await;
        wait_for_state(&queue, "bad", JobState::Dead).await;

        let bad = queue.get("bad").await.expect("get");
        assert_eq!(bad.attempts, 1);
        assert_eq!(
            bad.error_message.as_deref(),
            Some("command exited with code 7")
        );

        shutdown_tx.send(()).expect("worker is listening");
        handle.await.expect("worker should stop cleanly");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_mid_job_returns_job_to_pending() {
        let (_dir, queue) = test_queue().await;

        queue
            .enqueue(JobSpec::new("sleep 1").with_id("slow"))
            .await
            .expect("enqueue");

        let (shutdown_tx, handle) = spawn_worker(&queue);

        // Give the worker time to claim and start the command, then stop it
        tokio::time::sleep(Duration::from_millis(200)).await;
        let job = queue.get("slow").await.expect("get");
        assert_eq!(job.state, JobState::Processing);

        shutdown_tx.send(()).expect("worker is listening");
        handle.await.expect("worker should stop cleanly");

        let job = queue.get("slow").await.expect("get");
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0, "no attempt charged for the interruption");
        assert!(job.error_message.is_none());
        assert!(job.lock_holder.is_none());
        assert!(job.lock_time.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_command_reports_exit_codes() {
        let status = execute_command("exit 0").await.expect("spawn");
        assert!(status.success());

        let status = execute_command("exit 7").await.expect("spawn");
        assert!(!status.success());
        assert_eq!(status.code(), Some(7));
        assert_eq!(describe_exit(status), "command exited with code 7");
    }
}
