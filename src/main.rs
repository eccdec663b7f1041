//! EFD Worker - background ingestion of SPED EFD fiscal files
//!
//! Polls `import_jobs` for pending uploads, streams each file into the
//! record tables with checkpointed batches and rebuilds the monthly aggregates.

mod admin;
mod cli;
mod config;
mod db;
mod defaults;
mod error;
mod services;
mod types;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use sqlx::PgPool;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Command};
use crate::config::Config;
use crate::services::cancellation::CancellationRegistry;
use crate::services::dispatcher::Dispatcher;
use crate::services::ingest::IngestContext;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs directory - use LOGS_DIR env var or default to ../logs (relative to worker)
    let logs_dir = std::env::var("LOGS_DIR").unwrap_or_else(|_| "../logs".to_string());
    std::fs::create_dir_all(&logs_dir).ok();

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &logs_dir, "worker.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,efd_worker=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer()) // stdout
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false)) // file
        .init();

    let config = Config::from_env()?;
    let pool = db::create_pool(&config).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(pool, config).await,
        Command::Migrate => db::run_migrations(&pool).await,
        Command::Enqueue { file } => admin::enqueue_file(&pool, &config, &file).await.map(|_| ()),
        Command::Status { job_id } => admin::print_status(&pool, job_id).await,
        Command::Cancel { job_id } => admin::cancel_job(&pool, job_id).await,
    }
}

async fn serve(pool: PgPool, config: Config) -> Result<()> {
    info!("Starting EFD Worker...");
    info!(
        workers = config.worker_count,
        batch_size = config.batch_size,
        upload_dir = %config.upload_dir.display(),
        "Configuration loaded"
    );

    db::run_migrations(&pool).await?;

    let cancellations = CancellationRegistry::new();
    let ctx = Arc::new(IngestContext::new(pool, Arc::new(config)));
    let dispatcher = Arc::new(Dispatcher::new(ctx, cancellations.clone()));

    dispatcher.recover_stale_jobs().await?;

    let signals = cancellations.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Shutdown requested; running jobs stop at their next batch boundary");
                signals.shutdown();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    if let Err(e) = dispatcher.run().await {
        error!("Dispatcher error: {}", e);
        return Err(e);
    }

    info!("EFD Worker stopped");
    Ok(())
}
