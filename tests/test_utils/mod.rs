//! Test utilities for queue testing.
//!
//! In-memory SQLite databases with migrations applied, job fixtures, a
//! scripted executor and a telemetry sink that records what it was told.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use calsync::error::QueueError;
use calsync::executor::{ExecutionContext, ExecutionResult, JobExecutor};
use calsync::models::sync_job::{self, SyncJobStatus};
use calsync::models::sync_job_log::SyncOutcome;
use calsync::telemetry::Telemetry;
use chrono::{DateTime, Utc};
use migration::{Migrator, MigratorTrait};
use sea_orm::{ActiveModelTrait, ConnectionTrait, Database, DatabaseConnection, Set, Statement};
use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

/// Sets up an in-memory SQLite database with all migrations applied.
#[allow(dead_code)]
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;

    Migrator::up(&db, None).await?;

    // Log rows reference their job; keep FK checks on so cascades behave like Postgres.
    db.execute(Statement::from_string(
        db.get_database_backend(),
        "PRAGMA foreign_keys = ON".to_string(),
    ))
    .await?;

    Ok(db)
}

/// Parameters for [`insert_job`].
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct JobFixture {
    pub pair_id: Uuid,
    pub connector_id: Uuid,
    pub status: SyncJobStatus,
    pub priority: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub next_run_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Default for JobFixture {
    fn default() -> Self {
        Self {
            pair_id: Uuid::new_v4(),
            connector_id: Uuid::new_v4(),
            status: SyncJobStatus::Pending,
            priority: 0,
            retry_count: 0,
            max_retries: 5,
            next_run_at: Utc::now() - chrono::Duration::seconds(5),
            payload: json!({ "type": "calendar.delta" }),
        }
    }
}

/// Inserts a sync job row directly for testing.
#[allow(dead_code)]
pub async fn insert_job(db: &DatabaseConnection, fixture: JobFixture) -> Result<sync_job::Model> {
    let now = Utc::now();
    let job = sync_job::ActiveModel {
        id: Set(Uuid::new_v4()),
        pair_id: Set(fixture.pair_id),
        connector_id: Set(fixture.connector_id),
        window_start: Set((now - chrono::Duration::days(1)).fixed_offset()),
        window_end: Set(now.fixed_offset()),
        payload: Set(fixture.payload),
        status: Set(fixture.status),
        priority: Set(fixture.priority),
        retry_count: Set(fixture.retry_count),
        max_retries: Set(fixture.max_retries),
        next_run_at: Set(fixture.next_run_at.fixed_offset()),
        last_error: Set(None),
        idempotency_key: Set(None),
        created_at: Set(now.fixed_offset()),
        updated_at: Set(now.fixed_offset()),
    };

    Ok(job.insert(db).await?)
}

/// Marks a job due again so a test can drive the next attempt immediately.
#[allow(dead_code)]
pub async fn make_due(db: &DatabaseConnection, job_id: Uuid) -> Result<()> {
    let past = (Utc::now() - chrono::Duration::seconds(1)).fixed_offset();
    let job = sync_job::ActiveModel {
        id: sea_orm::Unchanged(job_id),
        next_run_at: Set(past),
        ..Default::default()
    };
    job.update(db).await?;
    Ok(())
}

/// One scripted executor response.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum Step {
    Return(ExecutionResult),
    Error(String),
    Panic(String),
}

/// Executor that replays a fixed script, then reports success.
#[allow(dead_code)]
pub struct ScriptedExecutor {
    steps: Mutex<VecDeque<Step>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    pub started: Notify,
}

#[allow(dead_code)]
impl ScriptedExecutor {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            delay: None,
            calls: AtomicUsize::new(0),
            started: Notify::new(),
        }
    }

    pub fn succeeding() -> Self {
        Self::new([])
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        _job: &sync_job::Model,
        _ctx: &ExecutionContext,
    ) -> anyhow::Result<ExecutionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let step = self
            .steps
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .pop_front();

        match step {
            Some(Step::Return(result)) => Ok(result),
            Some(Step::Error(message)) => Err(anyhow::anyhow!(message)),
            Some(Step::Panic(message)) => panic!("{message}"),
            None => Ok(ExecutionResult::success(1)),
        }
    }
}

/// Telemetry calls captured by [`RecordingTelemetry`].
#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Status(SyncJobStatus, Uuid),
    Duration(SyncOutcome),
    Retry(Uuid),
    QueueDepthRefreshed,
}

#[allow(dead_code)]
#[derive(Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
    fail_refresh: bool,
}

#[allow(dead_code)]
impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink whose queue-depth refresh always errors.
    pub fn failing_refresh() -> Self {
        Self {
            fail_refresh: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    fn push(&self, event: TelemetryEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .push(event);
    }
}

#[async_trait]
impl Telemetry for RecordingTelemetry {
    fn record_job_status(&self, status: SyncJobStatus, connector_id: Uuid) {
        self.push(TelemetryEvent::Status(status, connector_id));
    }

    fn observe_job_duration(&self, outcome: SyncOutcome, _seconds: f64) {
        self.push(TelemetryEvent::Duration(outcome));
    }

    fn record_retry(&self, connector_id: Uuid) {
        self.push(TelemetryEvent::Retry(connector_id));
    }

    async fn refresh_queue_depth(&self) -> Result<(), QueueError> {
        if self.fail_refresh {
            return Err(QueueError::Telemetry("metrics backend unavailable".to_string()));
        }
        self.push(TelemetryEvent::QueueDepthRefreshed);
        Ok(())
    }
}
