//! CLI command definitions for queuectl.
//!
//! This module provides the command-line surface over the queue core:
//! enqueueing jobs, running workers, inspecting state and the dead letter
//! queue, and managing configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;
use tracing::info;

use crate::queue::{Job, JobQueue, JobSpec, JobState, PoolError, WorkerPool, WorkerPoolConfig};
use crate::storage::JobStore;

/// Default location of the queue database.
const DEFAULT_DB_PATH: &str = "data/queuectl.db";

/// Background job queue with workers, retry backoff and a dead letter queue.
#[derive(Parser)]
#[command(name = "queuectl")]
#[command(about = "Background job queue with workers, retry backoff and a dead letter queue")]
#[command(version)]
#[command(
    long_about = "queuectl runs shell commands as background jobs.\n\nJobs are stored in SQLite; workers claim them one at a time, execute them through the shell and retry failures with exponential backoff until the retry budget is spent, after which jobs land in the dead letter queue.\n\nExample usage:\n  queuectl enqueue 'tar czf /backups/home.tgz /home'\n  queuectl worker run --count 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the SQLite queue database.
    #[arg(long, env = "QUEUECTL_DB", default_value = DEFAULT_DB_PATH, global = true)]
    pub db: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Add a new job to the queue.
    Enqueue(EnqueueArgs),

    /// Run workers in the foreground.
    Worker(WorkerArgs),

    /// Show a summary of job states and configuration.
    Status,

    /// List jobs, optionally filtered by state.
    #[command(alias = "ls")]
    List(ListArgs),

    /// Remove a job from the queue.
    #[command(alias = "rm")]
    Remove(RemoveArgs),

    /// Inspect and requeue jobs in the dead letter queue.
    Dlq(DlqArgs),

    /// Read or change queue configuration.
    Config(ConfigArgs),
}

/// Arguments for `queuectl enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// The shell command to execute.
    pub command: String,

    /// Explicit job id (generated when omitted).
    #[arg(long)]
    pub id: Option<String>,

    /// Attempts allowed before the job moves to the dead letter queue.
    #[arg(long)]
    pub max_retries: Option<u32>,
}

/// Worker entrypoint arguments.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Worker subcommand to run.
    #[command(subcommand)]
    pub command: WorkerSubcommand,
}

/// Worker subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum WorkerSubcommand {
    /// Start workers and process jobs until interrupted.
    Run(WorkerRunArgs),
}

/// Arguments for `queuectl worker run`.
#[derive(Parser, Debug)]
pub struct WorkerRunArgs {
    /// Number of workers to start.
    #[arg(short, long, default_value = "1")]
    pub count: usize,

    /// Seconds to wait between polls when no job is eligible.
    #[arg(long, default_value = "1")]
    pub poll_interval_secs: u64,

    /// Seconds to wait for in-flight jobs during shutdown.
    #[arg(long, default_value = "30")]
    pub shutdown_grace_secs: u64,
}

/// Arguments for `queuectl list`.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Filter by state (pending, processing, completed, failed, dead).
    #[arg(short, long)]
    pub state: Option<JobState>,
}

/// Arguments for `queuectl remove`.
#[derive(Parser, Debug)]
pub struct RemoveArgs {
    /// Id of the job to remove.
    pub id: String,
}

/// Dead letter queue entrypoint arguments.
#[derive(Parser, Debug)]
pub struct DlqArgs {
    /// DLQ subcommand to run.
    #[command(subcommand)]
    pub command: DlqSubcommand,
}

/// Dead letter queue subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum DlqSubcommand {
    /// List jobs in the dead letter queue.
    List,

    /// Requeue a specific dead job with a fresh retry budget.
    Retry(DlqRetryArgs),

    /// Requeue every dead job.
    RetryAll,
}

/// Arguments for `queuectl dlq retry`.
#[derive(Parser, Debug)]
pub struct DlqRetryArgs {
    /// Id of the dead job to requeue.
    pub job_id: String,
}

/// Configuration entrypoint arguments.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Config subcommand to run.
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

/// Configuration subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum ConfigSubcommand {
    /// Print configuration values.
    Get(ConfigGetArgs),

    /// Set a configuration value.
    Set(ConfigSetArgs),
}

/// Arguments for `queuectl config get`.
#[derive(Parser, Debug)]
pub struct ConfigGetArgs {
    /// Key to read; prints all values when omitted.
    pub key: Option<String>,
}

/// Arguments for `queuectl config set`.
#[derive(Parser, Debug)]
pub struct ConfigSetArgs {
    /// Key to set (max-retries, backoff-base).
    pub key: String,

    /// New value, a non-negative integer.
    pub value: String,
}

/// Parses command line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the CLI with pre-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Enqueue(args) => run_enqueue_command(&cli.db, args).await?,
        Commands::Worker(args) => run_worker_command(&cli.db, args).await?,
        Commands::Status => run_status_command(&cli.db).await?,
        Commands::List(args) => run_list_command(&cli.db, args).await?,
        Commands::Remove(args) => run_remove_command(&cli.db, args).await?,
        Commands::Dlq(args) => run_dlq_command(&cli.db, args).await?,
        Commands::Config(args) => run_config_command(&cli.db, args).await?,
    }
    Ok(())
}

/// Opens the store at `db` and wraps it in the queue facade.
async fn open_queue(db: &Path) -> anyhow::Result<JobQueue> {
    let store = JobStore::open(db).await?;
    Ok(JobQueue::new(Arc::new(store)))
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn run_enqueue_command(db: &Path, args: EnqueueArgs) -> anyhow::Result<()> {
    let queue = open_queue(db).await?;

    let mut spec = JobSpec::new(args.command);
    if let Some(id) = args.id {
        spec = spec.with_id(id);
    }
    if let Some(max_retries) = args.max_retries {
        spec = spec.with_max_retries(max_retries);
    }

    let job = queue.enqueue(spec).await?;

    println!("Job enqueued");
    println!("  id:          {}", job.id);
    println!("  command:     {}", job.command);
    println!("  state:       {}", job.state);
    println!("  max retries: {}", job.max_retries);

    Ok(())
}

async fn run_worker_command(db: &Path, args: WorkerArgs) -> anyhow::Result<()> {
    match args.command {
        WorkerSubcommand::Run(args) => run_worker_run_command(db, args).await,
    }
}

async fn run_worker_run_command(db: &Path, args: WorkerRunArgs) -> anyhow::Result<()> {
    let queue = open_queue(db).await?;

    let config = WorkerPoolConfig::new(args.count)
        .with_poll_interval(Duration::from_secs(args.poll_interval_secs.max(1)))
        .with_shutdown_grace(Duration::from_secs(args.shutdown_grace_secs));

    let mut pool = WorkerPool::new(config, queue);
    pool.start()?;

    println!("Started {} worker(s). Press Ctrl-C to stop.", args.count);

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    match pool.shutdown().await {
        Ok(()) => {
            let stats = pool.stats();
            println!(
                "All workers stopped ({} succeeded, {} failed).",
                stats.jobs_succeeded, stats.jobs_failed
            );
        }
        Err(PoolError::ShutdownTimeout(grace)) => {
            println!(
                "Grace period of {}s elapsed with jobs still in flight; \
                 their leases become reclaimable once stale.",
                grace.as_secs()
            );
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

async fn run_status_command(db: &Path) -> anyhow::Result<()> {
    let queue = open_queue(db).await?;
    let stats = queue.stats().await?;
    let config = queue.all_config().await?;

    println!("Queue status");
    println!();
    println!("  pending:     {}", stats.pending);
    println!("  processing:  {}", stats.processing);
    println!("  completed:   {}", stats.completed);
    println!("  failed:      {}", stats.failed);
    println!("  dead (DLQ):  {}", stats.dead);
    println!("  total:       {}", stats.total());
    println!();
    println!("Configuration");
    println!();
    for (key, value) in &config {
        println!("  {}: {}", key, value);
    }

    Ok(())
}

async fn run_list_command(db: &Path, args: ListArgs) -> anyhow::Result<()> {
    let queue = open_queue(db).await?;
    let jobs = queue.list(args.state).await?;

    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    for job in &jobs {
        print_job(job);
    }
    println!("{}", "-".repeat(60));
    println!("{} job(s)", jobs.len());

    Ok(())
}

async fn run_remove_command(db: &Path, args: RemoveArgs) -> anyhow::Result<()> {
    let queue = open_queue(db).await?;
    queue.remove(&args.id).await?;
    println!("Job '{}' removed", args.id);
    Ok(())
}

async fn run_dlq_command(db: &Path, args: DlqArgs) -> anyhow::Result<()> {
    let queue = open_queue(db).await?;

    match args.command {
        DlqSubcommand::List => {
            let jobs = queue.dead_letter_jobs().await?;
            if jobs.is_empty() {
                println!("Dead letter queue is empty");
                return Ok(());
            }

            for job in &jobs {
                println!("{}", "-".repeat(60));
                println!("id:        {}", job.id);
                println!("command:   {}", job.command);
                println!("attempts:  {}/{}", job.attempts, job.max_retries);
                println!(
                    "error:     {}",
                    job.error_message.as_deref().unwrap_or("unknown")
                );
                println!("failed at: {}", format_time(job.updated_at));
            }
            println!("{}", "-".repeat(60));
            println!("{} job(s) in the dead letter queue", jobs.len());
        }
        DlqSubcommand::Retry(args) => {
            let job = queue.retry_from_dlq(&args.job_id).await?;
            println!("Job '{}' moved back to queue ({})", job.id, job.state);
        }
        DlqSubcommand::RetryAll => {
            let count = queue.retry_all_from_dlq().await?;
            println!("{} job(s) moved back to queue", count);
        }
    }

    Ok(())
}

async fn run_config_command(db: &Path, args: ConfigArgs) -> anyhow::Result<()> {
    let queue = open_queue(db).await?;

    match args.command {
        ConfigSubcommand::Get(args) => match args.key {
            Some(key) => match queue.get_config(&key).await? {
                Some(value) => println!("{}: {}", key, value),
                None => println!("{} is not set", key),
            },
            None => {
                for (key, value) in &queue.all_config().await? {
                    println!("{}: {}", key, value);
                }
            }
        },
        ConfigSubcommand::Set(args) => {
            let value: i64 = args
                .value
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("config value must be a non-negative integer"))?;
            queue.set_config(&args.key, value).await?;
            println!("Configuration updated");
            println!("  {}: {}", args.key, value);
        }
    }

    Ok(())
}

/// Prints one job in the block format used by `list`.
fn print_job(job: &Job) {
    println!("{}", "-".repeat(60));
    println!("id:          {}", job.id);
    println!("command:     {}", job.command);
    println!("state:       {}", job.state);
    println!("attempts:    {}/{}", job.attempts, job.max_retries);
    println!("created:     {}", format_time(job.created_at));
    if let Some(error) = &job.error_message {
        println!("error:       {}", error);
    }
    if let Some(at) = job.next_retry_at {
        println!("next retry:  {}", format_time(at));
    }
    if let Some(holder) = &job.lock_holder {
        println!("locked by:   {}", holder);
    }
}

fn format_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_enqueue() {
        let cli = Cli::try_parse_from([
            "queuectl",
            "enqueue",
            "echo hello",
            "--id",
            "job-1",
            "--max-retries",
            "5",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Enqueue(args) => {
                assert_eq!(args.command, "echo hello");
                assert_eq!(args.id.as_deref(), Some("job-1"));
                assert_eq!(args.max_retries, Some(5));
            }
            _ => panic!("expected enqueue command"),
        }
    }

    #[test]
    fn test_parse_list_state_filter() {
        let cli =
            Cli::try_parse_from(["queuectl", "list", "--state", "dead"]).expect("should parse");

        match cli.command {
            Commands::List(args) => assert_eq!(args.state, Some(JobState::Dead)),
            _ => panic!("expected list command"),
        }

        assert!(Cli::try_parse_from(["queuectl", "list", "--state", "zombie"]).is_err());
    }

    #[test]
    fn test_parse_worker_run_defaults() {
        let cli = Cli::try_parse_from(["queuectl", "worker", "run"]).expect("should parse");

        match cli.command {
            Commands::Worker(args) => match args.command {
                WorkerSubcommand::Run(args) => {
                    assert_eq!(args.count, 1);
                    assert_eq!(args.poll_interval_secs, 1);
                    assert_eq!(args.shutdown_grace_secs, 30);
                }
            },
            _ => panic!("expected worker command"),
        }
    }
}
