//! CLI command definitions for forge-queue.
//!
//! `stats` inspects the queue sets of a running fleet; `demo` joins the
//! fleet with a small map-reduce worker and waits for its tasks to finish.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::config::QueueConfig;
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{Chunk, Job, QueueBuilder, QueueStats, Task, WorkerDefinition};

/// Name of the worker registered by `demo`.
const DEMO_WORKER: &str = "double";

/// Distributed map-reduce task queue.
#[derive(Parser)]
#[command(name = "forge-queue")]
#[command(about = "Inspect and exercise a distributed map-reduce task queue")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the number of tasks in each queue set.
    Stats(StatsArgs),

    /// Run a map-reduce demo worker until its tasks finish.
    Demo(DemoArgs),
}

/// Store connection options shared by all commands.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Redis URL (defaults to QUEUE_REDIS_URL, REDIS_URL, then redis://localhost:6379).
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Key prefix (defaults to QUEUE_PREFIX, then "queue:").
    #[arg(long)]
    pub prefix: Option<String>,
}

impl StoreArgs {
    /// Environment configuration with command-line overrides applied.
    fn config(&self) -> anyhow::Result<QueueConfig> {
        let mut config = QueueConfig::from_env()?;
        if let Some(url) = &self.redis_url {
            config.redis_url = url.clone();
        }
        if let Some(prefix) = &self.prefix {
            config.prefix = prefix.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct StatsArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct DemoArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Number of tasks to push.
    #[arg(short = 'n', long, default_value = "3")]
    pub tasks: usize,

    /// Number of chunks each task is split into.
    #[arg(short = 'c', long, default_value = "4")]
    pub chunks: usize,

    /// Maximum chunks this process runs at once.
    #[arg(long)]
    pub chunks_per_instance: Option<usize>,

    /// Seconds to wait for all tasks before giving up.
    #[arg(long, default_value = "60")]
    pub wait_secs: u64,

    /// Print Prometheus metrics when done.
    #[arg(long)]
    pub metrics: bool,
}

/// Parse command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Stats(args) => run_stats_command(args).await,
        Commands::Demo(args) => run_demo_command(args).await,
    }
}

#[derive(Serialize)]
struct StatsReport<'a> {
    prefix: &'a str,
    postponed: usize,
    pending: usize,
    mapping: usize,
    aggregating: usize,
    reducing: usize,
    total: usize,
}

async fn run_stats_command(args: StatsArgs) -> anyhow::Result<()> {
    let config = args.store.config()?;
    let queue = QueueBuilder::connect(&config)
        .await
        .with_context(|| format!("connecting to {}", config.redis_url))?
        .build();

    let stats = queue.stats().await?;

    if args.json {
        let report = StatsReport {
            prefix: &config.prefix,
            postponed: stats.postponed,
            pending: stats.pending,
            mapping: stats.mapping,
            aggregating: stats.aggregating,
            reducing: stats.reducing,
            total: stats.total(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_stats(&config.prefix, &stats);
    }

    Ok(())
}

fn print_stats(prefix: &str, stats: &QueueStats) {
    println!("Queue '{}'", prefix);
    println!("  postponed:   {}", stats.postponed);
    println!("  pending:     {}", stats.pending);
    println!("  mapping:     {}", stats.mapping);
    println!("  aggregating: {}", stats.aggregating);
    println!("  reducing:    {}", stats.reducing);
    println!("  total:       {}", stats.total());
}

/// Splits `{"n": N}` into chunks `0..N`, doubles each and sums the results.
struct DoubleJob {
    results: mpsc::UnboundedSender<(String, i64)>,
}

#[async_trait]
impl Job for DoubleJob {
    async fn map(&self, task: &Task) -> anyhow::Result<Vec<Value>> {
        let n = task
            .data()
            .get("n")
            .and_then(Value::as_u64)
            .context("task data must contain a non-negative integer 'n'")?;
        Ok((0..n).map(|i| json!(i)).collect())
    }

    async fn process(&self, chunk: &Chunk) -> anyhow::Result<Value> {
        let value = chunk.data().as_i64().context("chunk data must be an integer")?;
        Ok(json!(value * 2))
    }

    async fn reduce(&self, task: &Task, results: Vec<Value>) -> anyhow::Result<()> {
        let sum: i64 = results.iter().filter_map(Value::as_i64).sum();
        info!(task_id = %task.id(), sum, "Reduced demo task");
        // The demo may have timed out and dropped the receiver
        let _ = self.results.send((task.id().to_string(), sum));
        Ok(())
    }
}

async fn run_demo_command(args: DemoArgs) -> anyhow::Result<()> {
    let config = args.store.config()?;

    if args.metrics {
        init_metrics()?;
    }

    let (results_tx, mut results_rx) = mpsc::unbounded_channel();
    let mut worker = WorkerDefinition::new(
        DEMO_WORKER,
        DoubleJob {
            results: results_tx,
        },
    )
    .with_retry_delay(Duration::from_secs(1));
    if let Some(limit) = args.chunks_per_instance {
        worker = worker.with_chunks_per_instance(limit);
    }

    let queue = QueueBuilder::connect(&config)
        .await
        .with_context(|| format!("connecting to {}", config.redis_url))?
        .register_worker(worker)?
        .build();

    let mut errors = queue.subscribe();
    tokio::spawn(async move {
        loop {
            match errors.recv().await {
                Ok(err) => warn!(error = %err, "Demo task error"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Demo error listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    queue.start()?;

    for i in 0..args.tasks {
        let task_id = queue
            .push(DEMO_WORKER, &json!({ "n": args.chunks, "seq": i }))
            .await?;
        info!(task_id = %task_id, chunks = args.chunks, "Pushed demo task");
    }

    let expected: i64 = (0..args.chunks as i64).map(|i| i * 2).sum();
    let deadline = tokio::time::sleep(Duration::from_secs(args.wait_secs));
    tokio::pin!(deadline);

    let mut finished = 0;
    while finished < args.tasks {
        tokio::select! {
            Some((task_id, sum)) = results_rx.recv() => {
                finished += 1;
                println!("{} -> {} (expected {})", task_id, sum, expected);
            }
            _ = &mut deadline => {
                warn!(finished, total = args.tasks, "Timed out waiting for demo tasks");
                break;
            }
        }
    }

    queue.shutdown().await;

    print_stats(&config.prefix, &queue.stats().await?);
    if args.metrics {
        print!("{}", export_metrics());
    }

    if finished < args.tasks {
        anyhow::bail!("{} of {} demo tasks finished", finished, args.tasks);
    }

    Ok(())
}
