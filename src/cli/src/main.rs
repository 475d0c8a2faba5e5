//! Inspector CLI - Command-line interface for the Inspector job queue.
//!
//! Provides commands for enqueueing analysis and report jobs, and for
//! inspecting and recovering jobs in the store.

mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use commands::{enqueue, jobs};
use inspector_core::config::Config;
use inspector_core::db::Database;
use inspector_core::jobs::{JobEnqueuer, JobStore, PgJobStore};
use output::OutputFormat;

/// Inspector - inspection analysis job queue CLI
#[derive(Parser)]
#[command(
    name = "inspector",
    version,
    about = "Inspector - inspection analysis job queue",
    long_about = "CLI tool for enqueueing, inspecting and recovering Inspector background jobs.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Configuration file (TOML); environment variables override it
    #[arg(short, long, global = true, env = "INSPECTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a background job
    #[command(subcommand)]
    Enqueue(enqueue::EnqueueCommands),

    /// Job inspection and maintenance
    #[command(subcommand)]
    Jobs(jobs::JobCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::from_file(&path.to_string_lossy())?,
        None => Config::load()?,
    };

    let db = Database::new(&config.database).await?;
    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db.pool().clone()));

    match cli.command {
        Commands::Enqueue(cmd) => {
            let enqueuer = JobEnqueuer::new(store, config.jobs.defaults.clone());
            enqueue::execute(cmd, &enqueuer, cli.output).await
        }
        Commands::Jobs(cmd) => {
            jobs::execute(cmd, store.as_ref(), config.worker.stale_job_threshold, cli.output).await
        }
    }
}
