//! CLI command definitions for queued-tracking.
//!
//! Every command loads [`Settings`] (YAML file and `QUEUED_TRACKING_*`
//! environment overrides), connects to the configured backend and runs one
//! operation against the queue.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::config::Settings;
use crate::metrics::{export_metrics, init_metrics, MetricsCollector};
use crate::request_set::RequestSet;
use crate::service::QueuedTracking;
use crate::tracker::{SqliteTracker, Tracker, TrackerFactory};
use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerReport};

/// Default SQLite file receiving tracked requests.
const DEFAULT_TRACKER_DB: &str = "tracked_requests.db";

/// Sharded tracking-request queue with batch processing.
#[derive(Parser)]
#[command(name = "queued-tracking")]
#[command(about = "Queue tracking requests and process them in locked batches")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a YAML settings file. Without it, defaults and environment are used.
    #[arg(short, long, global = true, env = "QUEUED_TRACKING_CONFIG")]
    pub config: Option<PathBuf>,

    /// SQLite database the tracker writes processed requests into.
    #[arg(long, global = true, env = "QUEUED_TRACKING_TRACKER_DB", default_value = DEFAULT_TRACKER_DB)]
    pub tracker_db: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run one processing invocation and report throughput.
    Process,

    /// Run a pool of workers until interrupted with Ctrl-C.
    Work(WorkArgs),

    /// Show queued request sets per shard and held locks.
    Monitor(OutputArgs),

    /// Show remaining lock lifetimes, optionally forcing one lock open.
    LockStatus(LockStatusArgs),

    /// Print pending request sets of a shard without consuming them.
    PrintQueuedRequests(PrintQueuedArgs),

    /// Enqueue a request set read from a JSON file.
    Enqueue(EnqueueArgs),

    /// Exercise every backend primitive on scratch keys.
    Check,

    /// Print Prometheus metrics including current queue depth.
    Metrics,
}

#[derive(Parser, Debug)]
pub struct WorkArgs {
    /// Number of workers.
    #[arg(short = 'w', long, default_value = "1")]
    pub workers: usize,

    /// Milliseconds a worker waits after an invocation found nothing to do.
    #[arg(long, default_value = "1000")]
    pub poll_interval_ms: u64,
}

#[derive(Parser, Debug)]
pub struct OutputArgs {
    /// Output JSON instead of text.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct LockStatusArgs {
    /// Delete this lock key regardless of its holder.
    #[arg(long)]
    pub unlock: Option<String>,

    /// Output JSON instead of text.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct PrintQueuedArgs {
    /// Shard id to inspect.
    #[arg(short, long)]
    pub shard: u32,

    /// Maximum number of request sets to print.
    #[arg(long, default_value = "25")]
    pub limit: usize,
}

#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// JSON file holding one request set.
    #[arg(short, long)]
    pub file: PathBuf,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let settings = load_settings(cli.config.as_ref())?;

    match cli.command {
        Commands::Process => run_process_command(settings, &cli.tracker_db).await,
        Commands::Work(args) => run_work_command(settings, &cli.tracker_db, args).await,
        Commands::Monitor(args) => run_monitor_command(settings, &cli.tracker_db, args).await,
        Commands::LockStatus(args) => {
            run_lock_status_command(settings, &cli.tracker_db, args).await
        }
        Commands::PrintQueuedRequests(args) => {
            run_print_queued_command(settings, &cli.tracker_db, args).await
        }
        Commands::Enqueue(args) => run_enqueue_command(settings, &cli.tracker_db, args).await,
        Commands::Check => run_check_command(settings, &cli.tracker_db).await,
        Commands::Metrics => run_metrics_command(settings, &cli.tracker_db).await,
    }
}

fn load_settings(path: Option<&PathBuf>) -> anyhow::Result<Settings> {
    let settings = match path {
        Some(path) => Settings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => Settings::from_env().context("Failed to read settings from environment")?,
    };
    Ok(settings)
}

/// Opens the tracker database once and returns a factory sharing its pool.
async fn tracker_factory(path: &str) -> anyhow::Result<TrackerFactory> {
    let tracker = SqliteTracker::open(path)
        .await
        .with_context(|| format!("Failed to open tracker database {}", path))?;
    let pool = tracker.pool().clone();

    Ok(Arc::new(move || {
        Box::new(SqliteTracker::with_pool(pool.clone())) as Box<dyn Tracker>
    }))
}

async fn connect(settings: Settings, tracker_db: &str) -> anyhow::Result<QueuedTracking> {
    let factory = tracker_factory(tracker_db).await?;
    QueuedTracking::connect(settings, factory)
        .await
        .context("Failed to connect to queue backend")
}

// ============================================================================
// Processing
// ============================================================================

async fn run_process_command(settings: Settings, tracker_db: &str) -> anyhow::Result<()> {
    let service = connect(settings, tracker_db).await?;
    let mut worker = service.worker()?;

    match worker.run_once().await? {
        WorkerReport::Processed(stats) => {
            println!(
                "Processed {} request sets ({} requests) in {:.2}s, {:.1} req/s",
                stats.request_sets,
                stats.requests,
                stats.elapsed.as_secs_f64(),
                stats.requests_per_second()
            );
            if stats.dropped > 0 {
                println!("Dropped {} request sets after retry", stats.dropped);
            }
        }
        WorkerReport::NothingToProcess => println!("Nothing to process"),
        WorkerReport::CapacityExhausted => {
            println!("All shards are locked by other workers, nothing to do")
        }
        WorkerReport::AlreadyRunning => println!("Another process is already running"),
        WorkerReport::TrackingDisabled => println!("Tracking is disabled, queue left untouched"),
    }
    Ok(())
}

async fn run_work_command(
    settings: Settings,
    tracker_db: &str,
    args: WorkArgs,
) -> anyhow::Result<()> {
    let service = connect(settings, tracker_db).await?;
    let config = WorkerPoolConfig::new(args.workers)
        .with_poll_interval(Duration::from_millis(args.poll_interval_ms));

    let mut pool = WorkerPool::new(
        config,
        service.backend().clone(),
        service.settings().clone(),
        service.tracker_factory(),
    );
    pool.start()?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Interrupt received, stopping workers");
    pool.shutdown().await?;

    let stats = pool.stats();
    println!(
        "Workers: {}  invocations: {}  request sets: {}  requests: {}  dropped: {}  failures: {}",
        stats.num_workers,
        stats.invocations,
        stats.request_sets_processed,
        stats.requests_processed,
        stats.request_sets_dropped,
        stats.failures
    );
    Ok(())
}

// ============================================================================
// Inspection
// ============================================================================

async fn run_monitor_command(
    settings: Settings,
    tracker_db: &str,
    args: OutputArgs,
) -> anyhow::Result<()> {
    let service = connect(settings, tracker_db).await?;
    let summary = service.status()?.monitor().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!(
        "{} shards, batch size {}, {} request sets queued",
        summary.shard_count, summary.batch_size, summary.total_queued
    );
    for shard in &summary.shards {
        let lock = if shard.lock_ttl_millis > 0 {
            format!("locked for {} ms", shard.lock_ttl_millis)
        } else {
            "unlocked".to_string()
        };
        println!("  shard {:>2}: {:>8} queued, {}", shard.shard_id, shard.queued, lock);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct LockStatusEntry {
    key: String,
    ttl_millis: u64,
}

async fn run_lock_status_command(
    settings: Settings,
    tracker_db: &str,
    args: LockStatusArgs,
) -> anyhow::Result<()> {
    let service = connect(settings, tracker_db).await?;
    let status = service.status()?;

    if let Some(key) = &args.unlock {
        if status.force_unlock(key).await? {
            println!("Unlocked {}", key);
        } else {
            println!("{} was not locked or is not a queue lock", key);
        }
    }

    let mut entries = Vec::new();
    for key in status.acquired_lock_keys().await? {
        let ttl_millis = status.lock_ttl_millis(&key).await?;
        entries.push(LockStatusEntry { key, ttl_millis });
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("No locks held");
    } else {
        for entry in &entries {
            println!("{} is locked for {} ms", entry.key, entry.ttl_millis);
        }
    }
    Ok(())
}

async fn run_print_queued_command(
    settings: Settings,
    tracker_db: &str,
    args: PrintQueuedArgs,
) -> anyhow::Result<()> {
    let service = connect(settings, tracker_db).await?;
    let pending = service
        .status()?
        .pending_requests(args.shard, args.limit)
        .await?;

    for request_set in &pending {
        println!("{}", request_set.to_json()?);
    }
    if pending.is_empty() {
        println!("Shard {} has no queued requests", args.shard);
    }
    Ok(())
}

async fn run_enqueue_command(
    settings: Settings,
    tracker_db: &str,
    args: EnqueueArgs,
) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let request_set = RequestSet::from_json(&content)
        .with_context(|| format!("Invalid request set in {}", args.file.display()))?;

    let service = connect(settings, tracker_db).await?;
    service.enqueue(&request_set).await?;
    println!("Enqueued {} requests", request_set.len());
    Ok(())
}

async fn run_check_command(settings: Settings, tracker_db: &str) -> anyhow::Result<()> {
    let service = connect(settings, tracker_db).await?;
    let checks = service.status()?.self_test().await?;

    let mut failed = 0;
    for check in &checks {
        println!("{:<24} {}", check.name, if check.passed { "ok" } else { "FAILED" });
        if !check.passed {
            failed += 1;
        }
    }

    if failed > 0 {
        anyhow::bail!("{} backend checks failed", failed);
    }
    println!("Backend {} works as expected", service.settings().backend);
    Ok(())
}

async fn run_metrics_command(settings: Settings, tracker_db: &str) -> anyhow::Result<()> {
    init_metrics()?;
    let service = connect(settings, tracker_db).await?;

    let collector = MetricsCollector::new();
    for shard in service.status()?.monitor().await?.shards {
        collector.set_queue_depth(shard.shard_id, shard.queued);
    }

    print!("{}", export_metrics());
    Ok(())
}
