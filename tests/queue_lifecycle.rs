//! End-to-end tests for the job queue.
//!
//! These tests run real shell commands through a worker pool against a
//! throwaway SQLite store, covering the full lifecycle: enqueue, claim,
//! execute, retry with backoff, dead-letter and graceful shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use queuectl::queue::{JobQueue, JobSpec, JobState, WorkerPool, WorkerPoolConfig};
use queuectl::storage::{config_keys, JobStore};

async fn open_queue(dir: &tempfile::TempDir) -> JobQueue {
    let store = JobStore::open(dir.path().join("queue.db"))
        .await
        .expect("open store");
    JobQueue::new(Arc::new(store))
}

fn fast_pool(queue: &JobQueue, workers: usize) -> WorkerPool {
    WorkerPool::new(
        WorkerPoolConfig::new(workers)
            .with_poll_interval(Duration::from_millis(25))
            .with_shutdown_grace(Duration::from_secs(10)),
        queue.clone(),
    )
}

async fn wait_for_state(queue: &JobQueue, id: &str, state: JobState, deadline: Duration) {
    let give_up = Instant::now() + deadline;
    loop {
        let job = queue.get(id).await.expect("job should exist");
        if job.state == state {
            return;
        }
        assert!(
            Instant::now() < give_up,
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
async fn pool_drains_mixed_queue() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let queue = open_queue(&dir).await;

    queue
        .enqueue(JobSpec::new("exit 0").with_id("ok-1"))
        .await
        .expect("enqueue");
    queue
        .enqueue(JobSpec::new("echo hello").with_id("ok-2"))
        .await
        .expect("enqueue");
    queue
        .enqueue(JobSpec::new("exit 3").with_id("bad").with_max_retries(1))
        .await
        .expect("enqueue");

    let mut pool = fast_pool(&queue, 2);
    pool.start().expect("start pool");

    wait_for_state(&queue, "ok-1", JobState::Completed, Duration::from_secs(10)).await;
    wait_for_state(&queue, "ok-2", JobState::Completed, Duration::from_secs(10)).await;
    wait_for_state(&queue, "bad", JobState::Dead, Duration::from_secs(10)).await;

    pool.shutdown().await.expect("shutdown pool");

    let dead = queue.dead_letter_jobs().await.expect("dlq");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, "bad");
    assert_eq!(dead[0].attempts, 1);
    assert_eq!(
        dead[0].error_message.as_deref(),
        Some("command exited with code 3")
    );

    let stats = queue.stats().await.expect("stats");
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.dead, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.processing, 0);

    let pool_stats = pool.stats();
    assert_eq!(pool_stats.jobs_succeeded, 2);
    assert_eq!(pool_stats.jobs_failed, 1);
}

#[cfg(unix)]
#[tokio::test]
async fn failing_job_walks_retry_schedule() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let queue = open_queue(&dir).await;

    // base 1 keeps the retry delay at one second so the test stays quick
    queue
        .set_config(config_keys::BACKOFF_BASE, 1)
        .await
        .expect("set config");
    queue
        .enqueue(JobSpec::new("exit 1").with_id("flaky").with_max_retries(2))
        .await
        .expect("enqueue");

    let mut pool = fast_pool(&queue, 1);
    pool.start().expect("start pool");

    // First failure parks the job with one attempt charged and a retry time
    wait_for_state(&queue, "flaky", JobState::Failed, Duration::from_secs(10)).await;
    let job = queue.get("flaky").await.expect("get");
    assert_eq!(job.attempts, 1);
    assert!(job.next_retry_at.is_some());
    assert!(job.lock_holder.is_none());

    // The retry exhausts the budget; the job never jumps to dead early
    wait_for_state(&queue, "flaky", JobState::Dead, Duration::from_secs(15)).await;
    let job = queue.get("flaky").await.expect("get");
    assert_eq!(job.attempts, 2);
    assert!(job.next_retry_at.is_none());

    pool.shutdown().await.expect("shutdown pool");
}

#[cfg(unix)]
#[tokio::test]
async fn dlq_retry_feeds_job_back_to_workers() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let queue = open_queue(&dir).await;

    queue
        .enqueue(JobSpec::new("exit 1").with_id("doomed").with_max_retries(1))
        .await
        .expect("enqueue");

    let mut pool = fast_pool(&queue, 1);
    pool.start().expect("start pool");

    wait_for_state(&queue, "doomed", JobState::Dead, Duration::from_secs(10)).await;

    // Manual requeue resets the bookkeeping...
    let job = queue.retry_from_dlq("doomed").await.expect("dlq retry");
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert!(job.error_message.is_none());

    // ...and the workers run it again to the same end
    wait_for_state(&queue, "doomed", JobState::Dead, Duration::from_secs(10)).await;
    let job = queue.get("doomed").await.expect("get");
    assert_eq!(job.attempts, 1);

    pool.shutdown().await.expect("shutdown pool");
}

#[cfg(unix)]
#[tokio::test]
async fn shutdown_mid_job_leaves_job_pending() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let queue = open_queue(&dir).await;

    queue
        .enqueue(JobSpec::new("sleep 1").with_id("slow"))
        .await
        .expect("enqueue");

    let mut pool = fast_pool(&queue, 1);
    pool.start().expect("start pool");

    // Let the worker claim the job and start the command
    tokio::time::sleep(Duration::from_millis(300)).await;
    let job = queue.get("slow").await.expect("get");
    assert_eq!(job.state, JobState::Processing);

    // The worker waits out the subprocess, then hands the claim back
    pool.shutdown().await.expect("shutdown pool");

    let job = queue.get("slow").await.expect("get");
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert!(job.error_message.is_none());
    assert!(job.lock_holder.is_none());
    assert!(job.lock_time.is_none());
}

#[tokio::test]
async fn store_survives_reopen() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("queue.db");

    {
        let store = JobStore::open(&path).await.expect("open store");
        let queue = JobQueue::new(Arc::new(store));
        queue
            .enqueue(JobSpec::new("echo persistent").with_id("keeper"))
            .await
            .expect("enqueue");
        queue
            .set_config(config_keys::MAX_RETRIES, 7)
            .await
            .expect("set config");
    }

    let store = JobStore::open(&path).await.expect("reopen store");
    let queue = JobQueue::new(Arc::new(store));

    let job = queue.get("keeper").await.expect("job survived restart");
    assert_eq!(job.command, "echo persistent");
    assert_eq!(job.state, JobState::Pending);

    assert_eq!(
        queue
            .get_config(config_keys::MAX_RETRIES)
            .await
            .expect("get config"),
        Some(7)
    );
}
