//! Inspector worker - runs background jobs until SIGINT/SIGTERM.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use inspector_core::{
    ai::AiClient,
    config::Config,
    db::Database,
    handlers::{AnalyzeInspectionHandler, GenerateReportHandler},
    inspections::{InspectionRepository, PgInspectionRepository},
    jobs::{HandlerRegistry, JobStore, PgJobStore, WorkerPool},
    notify::LogMailer,
    reports::{CommandDocumentGenerator, PgReportRepository},
    storage::{InMemoryStorage, LocalStorage, ObjectStorage},
    telemetry,
};

#[derive(Parser, Debug)]
#[command(name = "inspector-worker", version, about = "Inspector background job worker")]
struct Args {
    /// Configuration file (TOML); environment variables override it
    #[arg(short, long, env = "INSPECTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Skip running database migrations at startup
    #[arg(long)]
    skip_migrations: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(&path.to_string_lossy())?,
        None => Config::load()?,
    };

    telemetry::init_telemetry(&config.logging, &config.metrics)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        worker = %config.worker.name,
        concurrency = config.worker.concurrency,
        "Starting Inspector worker"
    );

    let db = Database::new(&config.database).await?;
    if !args.skip_migrations {
        db.migrate().await?;
    }

    let storage: Arc<dyn ObjectStorage> = match &config.storage.root {
        Some(root) => Arc::new(LocalStorage::new(root)),
        None => {
            tracing::warn!("No storage root configured; using in-memory storage");
            Arc::new(InMemoryStorage::new())
        }
    };

    if config.ai.api_key.is_empty() {
        tracing::warn!("AI API key not configured; image analysis will fail");
    }
    let analyzer = Arc::new(AiClient::new(config.ai.clone())?);

    let inspections: Arc<dyn InspectionRepository> =
        Arc::new(PgInspectionRepository::new(db.pool().clone()));

    let registry = HandlerRegistry::builder()
        .register(Arc::new(AnalyzeInspectionHandler::new(
            inspections.clone(),
            storage.clone(),
            analyzer,
        )))
        .register(Arc::new(
            GenerateReportHandler::new(
                inspections,
                Arc::new(PgReportRepository::new(db.pool().clone())),
                storage,
                Arc::new(CommandDocumentGenerator::from_config(&config.reports)),
                Arc::new(LogMailer::new()),
            )
            .with_image_url_ttl(config.storage.url_ttl)
            .with_download_url_ttl(config.reports.download_url_ttl),
        ))
        .build();

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db.pool().clone()));
    let pool = WorkerPool::new(store, Arc::new(registry), config.worker.clone());
    let handle = pool.start().await?;

    shutdown_signal().await;

    let stats = handle.stats().clone();
    if !handle.stop().await {
        tracing::warn!("Some workers did not stop in time and were abandoned");
    }

    tracing::info!(
        processed = stats.processed(),
        succeeded = stats.succeeded(),
        retried = stats.retried(),
        failed = stats.failed(),
        "Worker shutdown complete"
    );
    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
