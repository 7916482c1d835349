//! Command line front end for a jobkeeper deployment.
//!
//! Usage:
//!   jobkeeper run --config jobkeeper.toml
//!   jobkeeper enqueue --type email_notification --data '{"to":"a@b.c","subject":"s","body":"b"}'
//!   jobkeeper stats
//!   jobkeeper config
//!
//! Without `--config`, settings come from `JOBKEEPER_*` environment variables.
//! `enqueue` and `stats` talk to the configured store, so with the in-memory
//! backend they only see jobs from their own process.

use anyhow::Context;
use clap::{Parser, Subcommand};
use jobkeeper::{
    JobOptions, JobPayload, JobProcessor, JobkeeperConfig, Priority, SchedulerUpdate,
    logging::init_logging,
};
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "jobkeeper", version, about = "Background job queue and worker pool")]
struct Cli {
    #[arg(long, global = true, help = "Path to a TOML configuration file", value_name = "PATH")]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Run the scheduler with the built-in handlers until Ctrl-C")]
    Run {
        #[arg(long, help = "Override max_concurrent_jobs")]
        max_concurrent_jobs: Option<usize>,

        #[arg(long, help = "Override the poll interval in milliseconds", value_name = "MS")]
        poll_interval_ms: Option<u64>,
    },

    #[command(about = "Create a job")]
    Enqueue {
        #[arg(long = "type", help = "Job type", value_name = "TYPE")]
        job_type: String,

        #[arg(long, help = "JSON payload", default_value = "{}")]
        data: String,

        #[arg(long, help = "JSON metadata")]
        metadata: Option<String>,

        #[arg(long, help = "Priority 0-10 or a name (low, normal, high, ...)")]
        priority: Option<Priority>,

        #[arg(long, help = "Delay before first run, in seconds", value_name = "SECONDS")]
        delay: Option<u64>,

        #[arg(long)]
        max_retries: Option<u32>,

        #[arg(long, help = "Per-attempt timeout in seconds", value_name = "SECONDS")]
        timeout: Option<u64>,

        #[arg(long = "tag", help = "Tag, may be repeated")]
        tags: Vec<String>,
    },

    #[command(about = "Print job counts by status")]
    Stats,

    #[command(about = "Print the effective configuration as TOML")]
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            max_concurrent_jobs,
            poll_interval_ms,
        } => run(config, max_concurrent_jobs, poll_interval_ms).await,
        Command::Enqueue {
            job_type,
            data,
            metadata,
            priority,
            delay,
            max_retries,
            timeout,
            tags,
        } => {
            let mut payload = JobPayload::new(
                job_type,
                serde_json::from_str(&data).context("--data is not valid JSON")?,
            );
            if let Some(metadata) = metadata {
                payload = payload.with_metadata(
                    serde_json::from_str(&metadata).context("--metadata is not valid JSON")?,
                );
            }

            let mut options = JobOptions::new().with_tags(tags);
            if let Some(priority) = priority {
                options = options.with_priority(priority);
            }
            if let Some(delay) = delay {
                options = options.with_delay(Duration::from_secs(delay));
            }
            if let Some(max_retries) = max_retries {
                options = options.with_max_retries(max_retries);
            }
            if let Some(timeout) = timeout {
                options = options.with_timeout(Duration::from_secs(timeout));
            }

            let processor = JobProcessor::connect(&config).await?;
            let job = processor.create_job(payload, options).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }
        Command::Stats => {
            let processor = JobProcessor::connect(&config).await?;
            let stats = processor.get_job_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&str>) -> anyhow::Result<JobkeeperConfig> {
    match path {
        Some(path) => JobkeeperConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path)),
        None => JobkeeperConfig::from_env().context("invalid JOBKEEPER_* environment"),
    }
}

async fn run(
    config: JobkeeperConfig,
    max_concurrent_jobs: Option<usize>,
    poll_interval_ms: Option<u64>,
) -> anyhow::Result<()> {
    init_logging(&config.logging)?;

    let processor = JobProcessor::connect(&config).await?;
    let mut update = SchedulerUpdate::new();
    update.max_concurrent_jobs = max_concurrent_jobs;
    update.poll_interval = poll_interval_ms.map(Duration::from_millis);
    let settings = processor.configure(update)?;

    info!(
        "Running with handlers {:?}, max_concurrent_jobs={}, poll_interval={:?}",
        processor.registry().registered_types(),
        settings.max_concurrent_jobs,
        settings.poll_interval
    );
    processor.start();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Ctrl-C received, waiting for in-flight jobs");
    processor.shutdown().await;

    #[cfg(feature = "metrics")]
    if let Some(metrics) = processor.metrics() {
        println!("{}", metrics.render()?);
    }
    Ok(())
}
