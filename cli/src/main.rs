/*!
# Stevedore CLI

Command-line interface for Stevedore, a backend-agnostic job queue.

The CLI provides tools for:
- Pushing jobs with a JSON payload, optionally delayed
- Printing the number of eligible jobs per queue
- Purging queues
- Running a worker that logs and acknowledges every job it consumes

Queues and worker limits come from the TOML file given with `--config` and from
`STEVEDORE__*` environment variables. `--queue` accepts exact names and `*` globs.
*/

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use stevedore_core::worker::listen_for_signals;
use stevedore_core::{
    handler_fn, Delay, JobDescriptor, JobHandler, Payload, Queue, QueueManager, Settings, Worker,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Stevedore - Job Queue Client
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push a job
    Push {
        /// Job name
        #[arg(long, short)]
        name: String,

        /// Payload as a JSON object
        #[arg(long, short, default_value = "{}", conflicts_with = "payload_file")]
        payload: String,

        /// Read the payload from a JSON file
        #[arg(long)]
        payload_file: Option<PathBuf>,

        /// Delay in seconds before the job becomes eligible
        #[arg(long, short, default_value = "0")]
        delay: i64,

        /// Target queue; defaults to the first configured queue
        #[arg(long, short)]
        queue: Option<String>,
    },

    /// Show the number of eligible jobs per queue
    Stats {
        /// Queue names or globs
        #[arg(long, short)]
        queue: Vec<String>,
    },

    /// Drop every job of the selected queues
    Purge {
        /// Queue names or globs
        #[arg(long, short)]
        queue: Vec<String>,
    },

    /// Start a worker
    Work {
        /// Queue names or globs, consumed in the given order
        #[arg(long, short)]
        queue: Vec<String>,

        /// Worker name shown in logs
        #[arg(long)]
        name: Option<String>,

        /// What to do with consumed jobs
        #[arg(long, value_enum, default_value = "log")]
        handler: HandlerKind,

        /// Stop after this many jobs
        #[arg(long)]
        max_jobs: Option<u64>,

        /// Stop once the process uses this many megabytes
        #[arg(long)]
        memory_limit: Option<u64>,

        /// Stop after this many seconds
        #[arg(long)]
        time_limit: Option<u64>,

        /// Stop when this file exists
        #[arg(long)]
        kill_file: Option<PathBuf>,

        /// Stop as soon as no job is available
        #[arg(long)]
        stop_on_no_job: bool,

        /// Rate limit such as `100/min`; repeat to combine
        #[arg(long)]
        rate_limit: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum HandlerKind {
    /// Log the job and acknowledge it
    Log,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Push {
            name,
            payload,
            payload_file,
            delay,
            queue,
        } => {
            let manager = settings.connect().await?;
            push_job(&manager, name, payload, payload_file, delay, queue).await?;
        }
        Commands::Stats { queue } => {
            let manager = settings.connect().await?.filter(queue.as_slice())?;
            print_stats(&manager).await;
        }
        Commands::Purge { queue } => {
            let manager = settings.connect().await?.filter(queue.as_slice())?;
            purge(&manager).await?;
        }
        Commands::Work {
            queue,
            name,
            handler,
            max_jobs,
            memory_limit,
            time_limit,
            kill_file,
            stop_on_no_job,
            rate_limit,
        } => {
            let mut worker_settings = settings.worker.clone();
            worker_settings.name = name.or(worker_settings.name);
            worker_settings.max_jobs = max_jobs.or(worker_settings.max_jobs);
            worker_settings.memory_limit_mb = memory_limit.or(worker_settings.memory_limit_mb);
            worker_settings.time_limit_secs = time_limit.or(worker_settings.time_limit_secs);
            worker_settings.kill_file = kill_file.or(worker_settings.kill_file);
            worker_settings.stop_on_no_job |= stop_on_no_job;
            worker_settings.rate_limits.extend(rate_limit);

            let manager = settings.connect().await?.filter(queue.as_slice())?;
            let options = worker_settings.to_options()?;

            let worker = Worker::new(build_handler(handler));
            listen_for_signals(worker.termination_handle());

            let exit = worker.run(&manager, &options).await?;
            return Ok(ExitCode::from(u8::try_from(exit.code()).unwrap_or(1)));
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn push_job(
    manager: &QueueManager,
    name: String,
    payload: String,
    payload_file: Option<PathBuf>,
    delay: i64,
    queue: Option<String>,
) -> anyhow::Result<()> {
    let raw = match payload_file {
        Some(path) => {
            info!("Reading payload from {:?}", path);
            std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?
        }
        None => payload,
    };

    let value: serde_json::Value = serde_json::from_str(&raw).context("payload is not valid JSON")?;
    let payload = Payload::try_from(value)?;
    let job = JobDescriptor::new(name, payload);

    let id = manager
        .push_to(&job, Delay::from(delay), queue.as_deref())
        .await?;
    println!("{}", id);
    Ok(())
}

async fn print_stats(manager: &QueueManager) {
    let mut stats = Box::pin(manager.stats());

    while let Some((name, size)) = stats.next().await {
        match size {
            Ok(size) => println!("{}\t{}", name, size),
            Err(e) => {
                warn!(queue = %name, "Failed to read queue size: {}", e);
                println!("{}\terror: {}", name, e);
            }
        }
    }
}

async fn purge(manager: &QueueManager) -> anyhow::Result<()> {
    for queue in manager.queues() {
        match queue.as_purgeable() {
            Some(purgeable) => {
                purgeable.purge().await?;
                info!(queue = %queue.name(), "Queue purged");
            }
            None => warn!(queue = %queue.name(), "Queue cannot be purged"),
        }
    }
    Ok(())
}

fn build_handler(kind: HandlerKind) -> Arc<dyn JobHandler> {
    match kind {
        HandlerKind::Log => Arc::new(handler_fn(|job| {
            info!(
                job_id = %job.id(),
                job = job.name().unwrap_or("-"),
                attempts = job.attempts(),
                payload = %serde_json::Value::Object(job.payload().as_map().clone()),
                "Job received"
            );
            Ok(())
        })),
    }
}
