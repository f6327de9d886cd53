//! CLI command definitions for disq.
//!
//! `worker` runs a worker pool for a named application, `submit` invokes one
//! of its tasks and `queues` prints queue lengths and in-flight counts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use serde_json::{Map, Value};
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use crate::app::{App, AppRegistry};
use crate::config::{ClientSettings, TaskOptions};
use crate::envelope::TaskCall;
use crate::manager::{Invocation, TaskManager};
use crate::scheduler::{
    ExecutionModel, NestedModel, ProcessCommand, WorkerPool, WorkerPoolConfig,
};

/// Distributed task queue on top of Disque.
#[derive(Parser, Debug)]
#[command(name = "disq")]
#[command(about = "Run task workers and submit jobs through a Disque cluster")]
#[command(version)]
#[command(
    long_about = "disq turns registered tasks into Disque jobs and runs workers that execute them.\n\nExample usage:\n  disq worker arith --worker process --subworker thread --concurrency 2 --subconcurrency 4\n  disq submit arith add 1 2"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Run workers for an application.
    Worker(WorkerArgs),

    /// Invoke a task of an application.
    Submit(SubmitArgs),

    /// Show queue lengths and jobs in flight for an application.
    Queues(QueuesArgs),
}

/// Broker connection arguments shared by all subcommands.
#[derive(clap::Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Broker nodes (host:port), tried in order.
    #[arg(long, value_delimiter = ',')]
    pub nodes: Vec<String>,

    /// Queue shared by every task of the application.
    #[arg(long)]
    pub queue: Option<String>,

    /// YAML settings file.
    #[arg(long, env = "DISQ_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct WorkerArgs {
    /// Application name.
    pub app: String,

    /// Worker model.
    #[arg(short = 'w', long = "worker", value_enum, default_value_t = ExecutionModel::Thread)]
    pub worker: ExecutionModel,

    /// Worker model inside each process worker.
    #[arg(long = "subworker", value_enum)]
    pub subworker: Option<NestedModel>,

    /// Number of workers.
    #[arg(short = 'c', long, default_value_t = 1)]
    pub concurrency: usize,

    /// Number of sub workers inside each process worker.
    #[arg(long, default_value_t = 1)]
    pub subconcurrency: usize,

    /// Blocking timeout of each fetch, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub fetch_timeout_ms: u64,

    /// Stop when stdin is closed (set on children of a process pool).
    #[arg(long, hide = true)]
    pub supervised: bool,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

#[derive(clap::Args, Debug)]
pub struct SubmitArgs {
    /// Application name.
    pub app: String,

    /// Task name.
    pub task: String,

    /// Positional arguments, parsed as JSON (plain words are strings).
    pub args: Vec<String>,

    /// Keyword argument as key=value, value parsed as JSON.
    #[arg(long = "kwarg")]
    pub kwargs: Vec<String>,

    /// Queue to submit to instead of the task's own.
    #[arg(long = "task-queue")]
    pub task_queue: Option<String>,

    /// Seconds before the job becomes available.
    #[arg(long)]
    pub delay: Option<u64>,

    /// RFC 3339 time at which the job becomes available.
    #[arg(long)]
    pub at: Option<DateTime<Utc>>,

    /// Cron expression; the job becomes available at its next occurrence.
    #[arg(long)]
    pub cron: Option<String>,

    /// Job TTL in seconds.
    #[arg(long)]
    pub ttl: Option<u64>,

    /// Seconds without acknowledgement before redelivery.
    #[arg(long)]
    pub retry: Option<u64>,

    /// Number of nodes the job is replicated to.
    #[arg(long)]
    pub replicate: Option<u32>,

    /// Refuse the job when the queue already holds this many jobs.
    #[arg(long)]
    pub maxlen: Option<u64>,

    /// Let the broker reply before replication completes.
    #[arg(long = "async")]
    pub async_submit: bool,

    /// ADDJOB timeout in milliseconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Run the task in-process instead of submitting it.
    #[arg(long)]
    pub debug: bool,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

#[derive(clap::Args, Debug)]
pub struct QueuesArgs {
    /// Application name.
    pub app: String,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the built-in applications.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    run_with_apps(cli, &AppRegistry::with_builtin()).await
}

/// Run the CLI with the given applications.
///
/// Binaries embedding their own tasks call this with their registry.
pub async fn run_with_apps(cli: Cli, apps: &AppRegistry) -> anyhow::Result<()> {
    match cli.command {
        Commands::Worker(args) => run_worker_command(args, apps, &cli.log_level).await,
        Commands::Submit(args) => run_submit_command(args, apps).await,
        Commands::Queues(args) => run_queues_command(args, apps).await,
    }
}

// ============================================================================
// Worker Command Implementation
// ============================================================================

async fn run_worker_command(
    args: WorkerArgs,
    apps: &AppRegistry,
    log_level: &str,
) -> anyhow::Result<()> {
    let app = apps.get(&args.app)?;
    let pool_config = worker_pool_config(&args);
    pool_config.validate()?;

    let settings = load_settings(&args.connection)?;
    let manager = connect(&settings, app).await?;

    let mut pool = WorkerPool::new(pool_config, Arc::new(manager))?;
    if args.worker == ExecutionModel::Process {
        let child_args = child_worker_args(&args, &settings, log_level);
        let command = ProcessCommand::current_exe(child_args)
            .context("Failed to locate the current executable")?;
        pool = pool.with_process_command(command);
    }

    pool.start().await?;
    info!(app = %args.app, model = %args.worker, "Waiting for jobs, press Ctrl+C to stop");

    if args.supervised {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => signal.context("Failed to listen for Ctrl+C")?,
            () = stdin_closed() => info!("Parent closed stdin, stopping"),
        }
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
    }

    pool.shutdown().await?;
    let stats = pool.stats();
    info!(
        acked = stats.acked,
        failed = stats.failed,
        rejected = stats.rejected,
        ack_failures = stats.ack_failures,
        mean_ms = stats.mean_handling_time().as_millis() as u64,
        "Worker stopped"
    );
    Ok(())
}

fn worker_pool_config(args: &WorkerArgs) -> WorkerPoolConfig {
    let mut config = WorkerPoolConfig::new(args.worker, args.concurrency)
        .with_fetch_timeout(Duration::from_millis(args.fetch_timeout_ms));
    if let Some(nested) = args.subworker {
        config = config.with_nested(nested, args.subconcurrency);
    }
    config
}

/// Resolves once stdin reaches end of file or fails.
async fn stdin_closed() {
    let mut stdin = tokio::io::stdin();
    let mut buf = [0u8; 64];
    while let Ok(n) = stdin.read(&mut buf).await {
        if n == 0 {
            return;
        }
    }
}

/// Arguments of one child of a process pool.
///
/// The child runs the nested model, or a single coroutine worker when no
/// nested model is set, against the same nodes and queue as the parent.
fn child_worker_args(args: &WorkerArgs, settings: &ClientSettings, log_level: &str) -> Vec<String> {
    let (model, concurrency) = match args.subworker {
        Some(nested) => (nested.model(), args.subconcurrency),
        None => (ExecutionModel::Coroutine, 1),
    };

    let mut child = vec![
        "--log-level".to_string(),
        log_level.to_string(),
        "worker".to_string(),
        args.app.clone(),
        "--worker".to_string(),
        model.to_string(),
        "--concurrency".to_string(),
        concurrency.to_string(),
        "--fetch-timeout-ms".to_string(),
        args.fetch_timeout_ms.to_string(),
        "--supervised".to_string(),
        "--nodes".to_string(),
        settings.nodes.join(","),
    ];
    if let Some(queue) = &settings.queue {
        child.push("--queue".to_string());
        child.push(queue.clone());
    }
    if let Some(path) = &args.connection.config {
        child.push("--config".to_string());
        child.push(path.display().to_string());
    }
    child
}

// ============================================================================
// Submit Command Implementation
// ============================================================================

async fn run_submit_command(args: SubmitArgs, apps: &AppRegistry) -> anyhow::Result<()> {
    let app = apps.get(&args.app)?;
    let settings = load_settings(&args.connection)?;
    let manager = connect(&settings, app).await?;

    let call = TaskCall::from_parts(
        args.args.iter().map(|a| parse_json_arg(a)).collect(),
        parse_kwargs(&args.kwargs)?,
    );

    match manager.invoke(&args.task, call, &submit_overrides(&args)).await? {
        Invocation::Submitted(job_id) => println!("{}", job_id),
        Invocation::Completed(value) => println!("{}", value),
    }
    Ok(())
}

/// Per-call options given on the command line. Unset flags fall through.
fn submit_overrides(args: &SubmitArgs) -> TaskOptions {
    TaskOptions {
        queue: args.task_queue.clone(),
        delay: args.delay,
        at: args.at,
        cron: args.cron.clone(),
        debug: args.debug.then_some(true),
        ttl: args.ttl,
        retry: args.retry,
        replicate: args.replicate,
        maxlen: args.maxlen,
        async_submit: args.async_submit.then_some(true),
        timeout: args.timeout,
        max_workers: None,
    }
}

/// Parses a positional argument as JSON, falling back to a plain string.
fn parse_json_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_kwargs(raw: &[String]) -> anyhow::Result<Map<String, Value>> {
    raw.iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("keyword argument '{}' is not key=value", pair))?;
            Ok((key.to_string(), parse_json_arg(value)))
        })
        .collect()
}

// ============================================================================
// Queues Command Implementation
// ============================================================================

async fn run_queues_command(args: QueuesArgs, apps: &AppRegistry) -> anyhow::Result<()> {
    let app = apps.get(&args.app)?;
    let settings = load_settings(&args.connection)?;
    let manager = connect(&settings, app).await?;

    println!("{:<24} {:>8} {:>8} {:>8}", "QUEUE", "QUEUED", "ACTIVE", "LIMIT");
    for (queue, limit) in manager.queue_limits() {
        let queued = manager.gateway().qlen(&queue).await?;
        let active = manager.num_processing(&queue).await?;
        let limit = limit.map_or_else(|| "-".to_string(), |l| l.to_string());
        println!("{:<24} {:>8} {:>8} {:>8}", queue, queued, active, limit);
    }
    Ok(())
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Settings from the config file (or defaults), the environment, then flags.
fn load_settings(args: &ConnectionArgs) -> anyhow::Result<ClientSettings> {
    let mut settings = match &args.config {
        Some(path) => ClientSettings::from_yaml_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => ClientSettings::from_env()?,
    };

    if !args.nodes.is_empty() {
        settings.nodes = args.nodes.clone();
    }
    if let Some(queue) = &args.queue {
        settings.queue = Some(queue.clone());
    }
    settings.validate()?;
    Ok(settings)
}

/// Connects and registers the application's tasks.
async fn connect(settings: &ClientSettings, app: &App) -> anyhow::Result<TaskManager> {
    let mut settings = settings.clone();
    settings.defaults = app.options().merge(&settings.defaults);

    let mut manager = TaskManager::connect(&settings).await?;
    app.install(&mut manager)?;
    if manager.registry().is_empty() {
        warn!(app = %app.name(), "Application registers no task");
    }
    Ok(manager)
}
