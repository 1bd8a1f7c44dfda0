use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use cimet_pipeline::Config;
use cimet_source::Filter;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cimet")]
#[command(about = "CI test-metrics pipeline: ingest runs, cluster failures, send digests")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, env = "CIMET_CONFIG", global = true, default_value = "cimet.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion cycle for the given filters.
    Ingest {
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        machine_type: Option<String>,
        #[arg(long)]
        suite: Option<String>,
        /// Filter by posted date (YYYY-MM-DD).
        #[arg(long)]
        date: Option<String>,
        #[arg(long)]
        status: Option<String>,
        /// Bypass failure-template mining; runs and jobs still index.
        #[arg(long)]
        skip_templates: bool,
    },
    /// Build and send the digest for one branch.
    Report {
        #[arg(long)]
        branch: String,
        /// Report end date (YYYY-MM-DD).
        #[arg(long)]
        date: NaiveDate,
        /// Days of history ending at --date, inclusive.
        #[arg(long, default_value_t = 1)]
        days: u32,
        /// Restrict to one build id instead of deriving it.
        #[arg(long)]
        sha: Option<String>,
    },
    /// Run the cron orchestrator until a termination signal.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;

    match cli.command {
        Commands::Ingest {
            user,
            branch,
            machine_type,
            suite,
            date,
            status,
            skip_templates,
        } => {
            if skip_templates {
                config.miner.skip_templates = true;
            }
            let mut filters = Vec::new();
            if let Some(user) = user {
                filters.push(Filter::User(user));
            }
            if let Some(branch) = branch {
                filters.push(Filter::Branch(branch));
            }
            if let Some(machine_type) = machine_type {
                filters.push(Filter::MachineType(machine_type));
            }
            if let Some(suite) = suite {
                filters.push(Filter::Suite(suite));
            }
            if let Some(date) = date {
                filters.push(Filter::Date(date));
            }
            if let Some(status) = status {
                filters.push(Filter::Status(status));
            }

            let summary = cimet_pipeline::ingest_once(&config, &filters).await?;
            println!(
                "ingest complete: runs={} jobs={} clustered={} skipped_runs={}",
                summary.runs, summary.jobs, summary.failures_clustered, summary.skipped_runs
            );
        }
        Commands::Report {
            branch,
            date,
            days,
            sha,
        } => {
            let start = date - chrono::Duration::days(i64::from(days.max(1)) - 1);
            let sent =
                cimet_pipeline::report_once(&config, &branch, start, date, sha.as_deref()).await?;
            if sent {
                println!("report sent for branch {branch}");
            } else {
                println!("no data for branch {branch}, nothing sent");
            }
        }
        Commands::Schedule => {
            cimet_pipeline::run_scheduler(config).await?;
        }
    }

    Ok(())
}
