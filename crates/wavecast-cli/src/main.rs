use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveTime, TimeDelta, Utc, Weekday};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use wavecast_client::{ExecutorConfig, HttpStageExecutor};
use wavecast_core::channel::{NewChannel, PostingSchedule, PostingWindow, RateBudget};
use wavecast_core::circuit_breaker::CircuitBreakerConfig;
use wavecast_core::config::OrchestratorConfig;
use wavecast_core::item::{ItemStage, NewItem, Stage};
use wavecast_core::job::{JobFilter, JobStatus};
use wavecast_core::job_queue::JobQueue;
use wavecast_core::orchestrator::ChannelOrchestrator;
use wavecast_core::pipeline::OperatorService;
use wavecast_core::pool::{PoolConfig, run_pool};
use wavecast_core::resolver::{CachedScopeResolver, StaticScopeResolver};
use wavecast_core::runner::ExecutorRunner;
use wavecast_core::traits::ItemStore;
use wavecast_core::wave::WaveMemberRequest;
use wavecast_core::worker::TracingWorkerReporter;
use wavecast_db::{
    ChannelRepository, Database, DatabaseConfig, ItemRepository, JobRepository, QuotaRepository,
    StateRepository, WaveRepository,
};

type Operator = OperatorService<JobRepository, ItemRepository, WaveRepository, StateRepository>;

#[derive(Parser)]
#[command(name = "wavecast", version, about = "Multi-channel publication orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,

    /// Run a pool of stage workers until Ctrl+C
    ///
    /// The stage runner is configured through WAVECAST_EXECUTOR_URL,
    /// WAVECAST_EXECUTOR_TOKEN and WAVECAST_EXECUTOR_TIMEOUT_SECS.
    Worker {
        /// Number of concurrent workers
        #[arg(short, long, env = "WAVECAST_WORKERS")]
        workers: Option<usize>,
    },

    /// Register a discovered item and queue its Discovery job
    Submit {
        /// Source reference (URL or upstream id)
        #[arg(short, long)]
        source: String,

        /// Channel to publish to (repeatable)
        #[arg(short, long = "channel")]
        channels: Vec<Uuid>,

        #[arg(short, long, default_value_t = 0)]
        priority: i32,
    },

    /// Manage publication channels
    #[command(subcommand)]
    Channel(ChannelCommand),

    /// Schedule and inspect publication waves
    #[command(subcommand)]
    Wave(WaveCommand),

    /// Inspect or fail content items
    #[command(subcommand)]
    Item(ItemCommand),

    /// Inspect processing jobs
    #[command(subcommand)]
    Job(JobCommand),

    /// List or retry dead jobs
    #[command(subcommand)]
    Dead(DeadCommand),

    /// Stop all workers from leasing new jobs
    Pause,

    /// Let workers lease jobs again
    Resume,

    /// Show orchestrator state and queue counts
    Status,

    /// Return expired leases to the queue
    Reap,

    /// Delete terminal jobs older than the given age
    Archive {
        /// Age in days
        #[arg(long, default_value_t = 30)]
        older_than_days: i64,
    },
}

#[derive(Subcommand)]
enum ChannelCommand {
    /// Create a channel (created inactive)
    Create(CreateChannelArgs),
    /// List all channels
    List,
    Activate { id: Uuid },
    Deactivate { id: Uuid },
    /// Explain whether the channel can publish right now
    Eligibility { id: Uuid },
}

#[derive(Args)]
struct CreateChannelArgs {
    #[arg(short, long)]
    name: String,

    /// Opaque credential handle the publication runs under
    #[arg(short, long)]
    scope: String,

    /// IANA timezone the posting windows are expressed in
    #[arg(long, default_value = "UTC")]
    timezone: String,

    /// Posting window as HH:MM-HH:MM (repeatable)
    #[arg(long = "window", value_parser = parse_window)]
    windows: Vec<(NaiveTime, NaiveTime)>,

    /// Days the windows apply to, e.g. mon,tue,fri (default: every day)
    #[arg(long, value_delimiter = ',')]
    days: Vec<Weekday>,

    /// Minimum seconds between two publications
    #[arg(long)]
    min_interval: Option<u64>,

    /// Publications allowed per rate window
    #[arg(long, default_value_t = 6)]
    capacity: i64,

    /// Rate window length in seconds
    #[arg(long, default_value_t = 86_400)]
    window_secs: i64,
}

#[derive(Subcommand)]
enum WaveCommand {
    /// Schedule a wave of publications for a target time
    Schedule {
        /// Target time (RFC 3339)
        #[arg(short, long)]
        at: DateTime<Utc>,

        /// Member as ITEM_ID:CHANNEL_ID (repeatable)
        #[arg(short, long = "member", value_parser = parse_member, required = true)]
        members: Vec<WaveMemberRequest>,

        #[arg(short, long)]
        label: Option<String>,
    },
    /// Add members to a wave whose target is still ahead
    Add {
        id: Uuid,

        #[arg(short, long = "member", value_parser = parse_member, required = true)]
        members: Vec<WaveMemberRequest>,
    },
    /// Show a wave and its aggregated status
    Status { id: Uuid },
}

#[derive(Subcommand)]
enum ItemCommand {
    /// Show an item with all of its jobs
    Show { id: Uuid },
    /// List items, newest first
    List {
        #[arg(long)]
        stage: Option<ItemStage>,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Mark an item failed and discard its queued jobs
    Fail {
        id: Uuid,
        #[arg(short, long)]
        reason: String,
    },
}

#[derive(Subcommand)]
enum JobCommand {
    Show { id: Uuid },
    List {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long)]
        stage: Option<Stage>,
        #[arg(long)]
        item: Option<Uuid>,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum DeadCommand {
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Put a dead or discarded job back in the queue with a fresh attempt budget
    Retry { id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("wavecast=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = OrchestratorConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;

    match cli.command {
        Commands::Migrate => {
            let db = connect_db(&config, 1).await?;
            db.migrate().await.map_err(|e| anyhow::anyhow!(e))?;
            tracing::info!("Migrations applied");
        }
        Commands::Worker { workers } => {
            let mut config = config;
            if let Some(workers) = workers {
                if workers == 0 {
                    bail!("--workers must be at least 1");
                }
                config.workers = workers;
            }
            let executor = ExecutorConfig::from_env().map_err(|e| anyhow::anyhow!(e))?;
            cmd_worker(&config, &executor).await?;
        }
        Commands::Submit {
            source,
            channels,
            priority,
        } => {
            let db = connect_db(&config, 1).await?;
            let (item, job) = operator(&db)
                .submit_item(NewItem::new(source).with_channels(channels), priority)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            print_json(&serde_json::json!({ "item": item, "job": job }))?;
        }
        Commands::Channel(command) => {
            let db = connect_db(&config, 1).await?;
            cmd_channel(command, &db).await?;
        }
        Commands::Wave(command) => {
            let db = connect_db(&config, 1).await?;
            cmd_wave(command, &operator(&db)).await?;
        }
        Commands::Item(command) => {
            let db = connect_db(&config, 1).await?;
            cmd_item(command, &db).await?;
        }
        Commands::Job(command) => {
            let db = connect_db(&config, 1).await?;
            cmd_job(command, &db.job_repo()).await?;
        }
        Commands::Dead(command) => {
            let db = connect_db(&config, 1).await?;
            let ops = operator(&db);
            match command {
                DeadCommand::List { limit } => {
                    let jobs = ops
                        .list_dead_jobs(limit)
                        .await
                        .map_err(|e| anyhow::anyhow!(e))?;
                    print_json(&jobs)?;
                }
                DeadCommand::Retry { id } => {
                    let job = ops.retry_dead_job(id).await.map_err(|e| anyhow::anyhow!(e))?;
                    print_json(&job)?;
                }
            }
        }
        Commands::Pause => {
            let db = connect_db(&config, 1).await?;
            operator(&db).pause().await.map_err(|e| anyhow::anyhow!(e))?;
        }
        Commands::Resume => {
            let db = connect_db(&config, 1).await?;
            operator(&db).resume().await.map_err(|e| anyhow::anyhow!(e))?;
        }
        Commands::Status => {
            let db = connect_db(&config, 1).await?;
            cmd_status(&db).await?;
        }
        Commands::Reap => {
            let db = connect_db(&config, 1).await?;
            let reclaimed = db
                .job_repo()
                .reclaim_expired_leases()
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            tracing::info!(reclaimed, "Expired leases reclaimed");
        }
        Commands::Archive { older_than_days } => {
            if older_than_days < 0 {
                bail!("--older-than-days must not be negative");
            }
            let db = connect_db(&config, 1).await?;
            let cutoff = Utc::now() - TimeDelta::days(older_than_days);
            let removed = operator(&db)
                .archive(cutoff)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            println!("{removed}");
        }
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL, sized for `workers` tasks.
async fn connect_db(config: &OrchestratorConfig, workers: usize) -> Result<Database> {
    let db_config = DatabaseConfig::from_env()
        .map_err(|e| anyhow::anyhow!(e))?
        .for_workers(workers);

    let db = Database::connect(&db_config)
        .await
        .context("Failed to connect to database")?
        .with_chain_settings(config.chain_settings())
        .with_lease_ttl(config.lease_ttl_delta());

    Ok(db)
}

fn operator(db: &Database) -> Operator {
    OperatorService::new(db.job_repo(), db.item_repo(), db.wave_repo(), db.state_repo())
}

fn channels(db: &Database) -> ChannelOrchestrator<ChannelRepository, QuotaRepository> {
    ChannelOrchestrator::new(db.channel_repo(), db.quota_repo())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_worker(config: &OrchestratorConfig, executor: &ExecutorConfig) -> Result<()> {
    let db = connect_db(config, config.workers).await?;
    db.migrate().await.map_err(|e| anyhow::anyhow!(e))?;

    let executor = HttpStageExecutor::new(executor).map_err(|e| anyhow::anyhow!(e))?;
    let resolver = CachedScopeResolver::new(
        StaticScopeResolver::new(db.channel_repo()),
        10_000,
        Duration::from_secs(60),
    );
    let runner = ExecutorRunner::new(
        executor,
        db.item_repo(),
        resolver,
        CircuitBreakerConfig::default(),
    );
    let pool_config = PoolConfig::new(config.workers, config.lease_ttl)
        .with_poll_interval(config.poll_interval);

    let cancel_token = CancellationToken::new();
    let shutdown = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, shutting down workers...");
            shutdown.cancel();
        }
    });

    tracing::info!(
        workers = config.workers,
        lease_ttl_secs = config.lease_ttl.as_secs(),
        "Starting worker pool"
    );
    run_pool(
        db.job_repo(),
        runner,
        pool_config,
        cancel_token,
        Arc::new(TracingWorkerReporter),
    )
    .await
    .map_err(|e| anyhow::anyhow!(e))
}

async fn cmd_channel(command: ChannelCommand, db: &Database) -> Result<()> {
    let orchestrator = channels(db);
    match command {
        ChannelCommand::Create(args) => {
            let channel = orchestrator
                .create_channel(new_channel(args))
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            print_json(&channel)?;
        }
        ChannelCommand::List => {
            let list = orchestrator
                .list_channels()
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            print_json(&list)?;
        }
        ChannelCommand::Activate { id } => {
            let channel = orchestrator.activate(id).await.map_err(|e| anyhow::anyhow!(e))?;
            print_json(&channel)?;
        }
        ChannelCommand::Deactivate { id } => {
            let channel = orchestrator
                .deactivate(id)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            print_json(&channel)?;
        }
        ChannelCommand::Eligibility { id } => {
            let eligibility = orchestrator
                .eligibility(id, Utc::now())
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            print_json(&eligibility)?;
        }
    }
    Ok(())
}

fn new_channel(args: CreateChannelArgs) -> NewChannel {
    let mut schedule = PostingSchedule::default().with_timezone(args.timezone);
    for (start, end) in args.windows {
        schedule = schedule.with_window(PostingWindow::new(start, end).on_days(args.days.clone()));
    }
    if let Some(secs) = args.min_interval {
        schedule = schedule.with_min_interval(secs);
    }
    NewChannel::new(args.name, args.scope)
        .with_schedule(schedule)
        .with_rate_budget(RateBudget {
            capacity: args.capacity,
            window_secs: args.window_secs,
            publish_cost: 1,
        })
}

async fn cmd_wave(command: WaveCommand, ops: &Operator) -> Result<()> {
    match command {
        WaveCommand::Schedule { at, members, label } => {
            let wave = ops
                .schedule_wave(members, at, label)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            print_json(&wave)?;
        }
        WaveCommand::Add { id, members } => {
            let wave = ops
                .add_wave_members(id, members)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            print_json(&wave)?;
        }
        WaveCommand::Status { id } => {
            let (wave, status) = ops.wave(id).await.map_err(|e| anyhow::anyhow!(e))?;
            print_json(&serde_json::json!({ "wave": wave, "status": status }))?;
        }
    }
    Ok(())
}

async fn cmd_item(command: ItemCommand, db: &Database) -> Result<()> {
    let ops = operator(db);
    match command {
        ItemCommand::Show { id } => {
            let detail = ops.item_detail(id).await.map_err(|e| anyhow::anyhow!(e))?;
            print_json(&serde_json::json!({ "item": detail.item, "jobs": detail.jobs }))?;
        }
        ItemCommand::List { stage, limit } => {
            let items = db
                .item_repo()
                .list_items(stage, limit)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            print_json(&items)?;
        }
        ItemCommand::Fail { id, reason } => {
            let item = ops
                .mark_item_failed(id, &reason)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            print_json(&item)?;
        }
    }
    Ok(())
}

async fn cmd_job(command: JobCommand, queue: &JobRepository) -> Result<()> {
    match command {
        JobCommand::Show { id } => {
            let job = queue
                .get_job(id)
                .await
                .map_err(|e| anyhow::anyhow!(e))?
                .with_context(|| format!("job {id} not found"))?;
            print_json(&job)?;
        }
        JobCommand::List {
            status,
            stage,
            item,
            limit,
        } => {
            let filter = JobFilter {
                status,
                stage,
                item_id: item,
                channel_id: None,
                limit,
            };
            let jobs = queue.list_jobs(filter).await.map_err(|e| anyhow::anyhow!(e))?;
            print_json(&jobs)?;
        }
    }
    Ok(())
}

async fn cmd_status(db: &Database) -> Result<()> {
    let state = operator(db).state().await.map_err(|e| anyhow::anyhow!(e))?;
    let queue = db.job_repo();

    println!("state: {state}");
    for status in [
        JobStatus::Queued,
        JobStatus::Retrying,
        JobStatus::Running,
        JobStatus::Dead,
    ] {
        let count = queue
            .count_by_status(status)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        println!("{:<10} {count}", status.as_str());
    }
    Ok(())
}

/// Parse `HH:MM-HH:MM` into a window's start and end.
fn parse_window(raw: &str) -> Result<(NaiveTime, NaiveTime), String> {
    let (start, end) = raw
        .split_once('-')
        .ok_or_else(|| format!("expected HH:MM-HH:MM, got '{raw}'"))?;
    let parse = |s: &str| {
        NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|e| format!("bad time '{s}': {e}"))
    };
    Ok((parse(start)?, parse(end)?))
}

/// Parse `ITEM_ID:CHANNEL_ID`.
fn parse_member(raw: &str) -> Result<WaveMemberRequest, String> {
    let (item, channel) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected ITEM_ID:CHANNEL_ID, got '{raw}'"))?;
    let item_id = item.parse().map_err(|e| format!("bad item id '{item}': {e}"))?;
    let channel_id = channel
        .parse()
        .map_err(|e| format!("bad channel id '{channel}': {e}"))?;
    Ok(WaveMemberRequest::new(item_id, channel_id))
}
