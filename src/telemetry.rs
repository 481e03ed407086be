//! Telemetry utilities: global subscriber management and the job metrics sink.

use std::any::type_name_of_val;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use log::LevelFilter;
use metrics::{counter, gauge, histogram};
use sea_orm::DatabaseConnection;
use sea_orm::Iterable;
use thiserror::Error;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::Layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::QueueError;
use crate::models::sync_job::SyncJobStatus;
use crate::models::sync_job_log::SyncOutcome;
use crate::repositories::sync_job::SyncJobRepository;

/// Errors that can occur while initializing global telemetry.
#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize global tracing/logging exactly once, wiring `log::` macros into the tracing pipeline.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    // sqlx logs through `log`, so the bridge goes in before the subscriber.
    if let Err(err) = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
    {
        let logger_type = type_name_of_val(log::logger());
        if !logger_type.contains("LogTracer") {
            eprintln!(
                "Warning: Failed to install log tracer bridge: {}. sqlx and sea-orm log records will not reach tracing.",
                err
            );
        }
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format.as_str() {
        "pretty" => fmt::layer().pretty().boxed(),
        _ => fmt::layer().json().boxed(),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        eprintln!(
            "Warning: Failed to set global tracing subscriber: {}. Default subscriber remains in effect.",
            err
        );
    }

    Ok(())
}

/// Sink for job lifecycle metrics.
///
/// `refresh_queue_depth` failures are reported to the caller, which logs
/// them; they never undo a committed finalize.
#[async_trait]
pub trait Telemetry: Send + Sync {
    fn record_job_status(&self, status: SyncJobStatus, connector_id: Uuid);

    fn observe_job_duration(&self, outcome: SyncOutcome, seconds: f64);

    fn record_retry(&self, connector_id: Uuid);

    async fn refresh_queue_depth(&self) -> Result<(), QueueError>;
}

/// [`Telemetry`] backed by the `metrics` facade.
///
/// No exporter is installed here; without a global recorder every call is a
/// no-op.
#[derive(Debug, Clone)]
pub struct MetricsTelemetry {
    db: DatabaseConnection,
}

impl MetricsTelemetry {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Telemetry for MetricsTelemetry {
    fn record_job_status(&self, status: SyncJobStatus, connector_id: Uuid) {
        let labels = vec![
            ("status", status.as_str().to_string()),
            ("connector_id", connector_id.to_string()),
        ];
        counter!("sync_job_status_total", &labels).increment(1);
    }

    fn observe_job_duration(&self, outcome: SyncOutcome, seconds: f64) {
        let labels = vec![("outcome", outcome.as_str().to_string())];
        histogram!("sync_job_duration_seconds", &labels).record(seconds);
    }

    fn record_retry(&self, connector_id: Uuid) {
        let labels = vec![("connector_id", connector_id.to_string())];
        counter!("sync_job_retries_total", &labels).increment(1);
    }

    async fn refresh_queue_depth(&self) -> Result<(), QueueError> {
        let counts = SyncJobRepository::new(self.db.clone())
            .count_by_status()
            .await?;
        record_queue_depth(&counts);
        Ok(())
    }
}

/// Sets the depth gauge for every status, using 0 for statuses with no rows.
fn record_queue_depth(counts: &HashMap<SyncJobStatus, u64>) {
    for status in SyncJobStatus::iter() {
        let depth = counts.get(&status).copied().unwrap_or(0);
        let labels = vec![("status", status.as_str().to_string())];
        gauge!("sync_queue_depth", &labels).set(depth as f64);
    }
}

/// Worker liveness gauges, emitted at startup and on every heartbeat.
pub fn record_heartbeat(worker_id: &str, in_flight: bool) {
    let labels = vec![("worker_id", worker_id.to_string())];
    let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
    gauge!("sync_worker_heartbeat_timestamp_seconds", &labels).set(now);
    gauge!("sync_worker_in_flight", &labels).set(if in_flight { 1.0 } else { 0.0 });
}
