//! # Worker Lifecycle
//!
//! Owns one [`QueueConsumer`] for the life of the process: emits heartbeats,
//! waits for a termination signal, drains the in-flight job and closes the
//! database pool.

use std::sync::Arc;
use std::time::Duration;

use sea_orm::DatabaseConnection;
use thiserror::Error;
use tokio::task::JoinError;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::consumer::{ConsumerConfig, QueueConsumer};
use crate::executor::JobExecutor;
use crate::telemetry::{Telemetry, record_heartbeat};

/// Errors raised while running or shutting down the worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker task failed: {0}")]
    Task(#[from] JoinError),
    #[error("failed to close database connection: {0}")]
    Disconnect(#[source] sea_orm::DbErr),
}

/// Timing knobs for the worker process.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_id: String,
    pub heartbeat_interval: Duration,
    pub shutdown_poll: Duration,
    pub consumer: ConsumerConfig,
}

impl From<&AppConfig> for WorkerSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            worker_id: config.worker.id.clone(),
            heartbeat_interval: config.worker.heartbeat_interval(),
            shutdown_poll: config.worker.shutdown_poll(),
            consumer: ConsumerConfig::from(config),
        }
    }
}

pub struct Worker {
    settings: WorkerSettings,
    db: DatabaseConnection,
    consumer: Arc<QueueConsumer>,
}

impl Worker {
    pub fn new(
        settings: WorkerSettings,
        db: DatabaseConnection,
        executor: Arc<dyn JobExecutor>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        let consumer = Arc::new(QueueConsumer::new(
            db.clone(),
            executor,
            telemetry,
            settings.consumer.clone(),
        ));
        Self {
            settings,
            db,
            consumer,
        }
    }

    pub fn consumer(&self) -> Arc<QueueConsumer> {
        Arc::clone(&self.consumer)
    }

    /// Run until `shutdown` is cancelled, then drain and disconnect.
    ///
    /// A job already executing when shutdown begins is allowed to finish;
    /// no new tick starts after that point.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let worker_id = self.settings.worker_id.clone();
        info!(worker_id = %worker_id, "Sync worker starting");
        record_heartbeat(&worker_id, false);

        let consumer_task = {
            let consumer = Arc::clone(&self.consumer);
            tokio::spawn(async move { consumer.run().await })
        };

        let heartbeat_stop = CancellationToken::new();
        let heartbeat_task = {
            let consumer = Arc::clone(&self.consumer);
            let stop = heartbeat_stop.clone();
            let every = self.settings.heartbeat_interval;
            let worker_id = worker_id.clone();
            tokio::spawn(async move {
                let mut ticker = interval(every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick completes immediately; the startup beat already went out.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {
                            let in_flight = consumer.is_processing();
                            record_heartbeat(&worker_id, in_flight);
                            debug!(worker_id = %worker_id, in_flight, "Worker heartbeat");
                        }
                    }
                }
            })
        };

        shutdown.cancelled().await;
        info!(worker_id = %worker_id, "Shutdown requested, draining in-flight job");

        self.consumer.stop();
        while self.consumer.is_processing() {
            sleep(self.settings.shutdown_poll).await;
        }

        heartbeat_stop.cancel();
        heartbeat_task.await?;
        consumer_task.await?;

        self.db.close().await.map_err(WorkerError::Disconnect)?;
        info!(worker_id = %worker_id, "Sync worker stopped");

        Ok(())
    }
}

/// Resolves on the first SIGINT or (on Unix) SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
