//! # calsync worker
//!
//! Entry point for the sync job worker process.

use std::sync::Arc;

use anyhow::{Context, Result};
use calsync::{
    config::ConfigLoader,
    consumer::{ConsumerConfig, QueueConsumer},
    db,
    executor::{ExecutorRegistry, NoopExecutor},
    migration::{Migrator, MigratorTrait},
    telemetry::{MetricsTelemetry, init_tracing},
    worker::{Worker, WorkerSettings, shutdown_signal},
};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "calsync", about = "Calendar sync job worker")]
struct Cli {
    /// Apply pending database migrations before starting
    #[arg(long)]
    migrate: bool,

    /// Drain the queue with a single tick and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new()
        .load()
        .context("loading configuration")?;
    init_tracing(&config).context("initializing tracing")?;

    info!(profile = %config.profile, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;

    if cli.migrate {
        Migrator::up(&db, None)
            .await
            .context("applying database migrations")?;
        info!("Database migrations applied");
    }

    let mut registry = ExecutorRegistry::new();
    registry.register(NoopExecutor::JOB_TYPE, Arc::new(NoopExecutor));
    let executor = Arc::new(registry);
    let telemetry = Arc::new(MetricsTelemetry::new(db.clone()));

    if cli.once {
        let consumer = QueueConsumer::new(
            db.clone(),
            executor,
            telemetry,
            ConsumerConfig::from(&config),
        );
        let processed = consumer.tick().await.context("draining sync queue")?;
        info!(processed, "Single tick finished");
        db.close().await.context("closing database connection")?;
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let worker = Worker::new(WorkerSettings::from(&config), db, executor, telemetry);
    worker.run(shutdown).await.context("running sync worker")?;

    Ok(())
}
