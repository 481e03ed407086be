//! # SyncJob Repository
//!
//! Scheduling entry point for sync jobs plus read helpers used by telemetry,
//! operators and tests. Scheduling de-duplicates on the idempotency key and
//! on an already-active job for the same pair, connector and window.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use sea_orm::sea_query::Expr;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{QueueError, db_context};
use crate::models::alert::{
    AlertCategory, Column as AlertColumn, Entity as Alert, Model as AlertModel,
};
use crate::models::connector_failure_stat::{
    Entity as ConnectorFailureStat, Model as FailureStatModel,
};
use crate::models::sync_job::{ActiveModel, Column, Entity, Model, SyncJobStatus};
use crate::models::sync_job_log::{
    Column as SyncJobLogColumn, Entity as SyncJobLog, Model as SyncJobLogModel,
};

/// `max_retries` used when neither the request nor the repository set one.
pub const DEFAULT_MAX_RETRIES: i32 = 5;

/// Request to schedule a sync window for a pair.
#[derive(Debug, Clone)]
pub struct ScheduleSyncJob {
    pub pair_id: Uuid,
    pub connector_id: Uuid,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub priority: Option<i32>,
    pub payload: Option<JsonValue>,
    pub idempotency_key: Option<String>,
    pub max_retries: Option<i32>,
    /// Earliest claim time; defaults to now
    pub run_at: Option<DateTime<Utc>>,
}

impl ScheduleSyncJob {
    pub fn new(
        pair_id: Uuid,
        connector_id: Uuid,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Self {
        Self {
            pair_id,
            connector_id,
            window_start,
            window_end,
            priority: None,
            payload: None,
            idempotency_key: None,
            max_retries: None,
            run_at: None,
        }
    }
}

/// Result of [`SyncJobRepository::schedule`].
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub job: Model,
    /// False when an existing job was returned instead of inserting
    pub created: bool,
}

/// Repository for sync job database operations
#[derive(Debug, Clone)]
pub struct SyncJobRepository {
    db: DatabaseConnection,
    default_max_retries: i32,
}

impl SyncJobRepository {
    /// Create a new SyncJobRepository with the given database connection
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Repository whose scheduling default follows `CALSYNC_RETRY_DEFAULT_MAX_RETRIES`.
    pub fn from_config(db: DatabaseConnection, config: &AppConfig) -> Self {
        Self::new(db).with_default_max_retries(config.retry.default_max_retries)
    }

    pub fn with_default_max_retries(mut self, max_retries: i32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    /// Schedule a sync job, returning an existing one when the request is a
    /// duplicate.
    ///
    /// - A matching `idempotency_key` always wins.
    /// - Otherwise an active (`pending`, `retrying`, `in_progress`) job for the
    ///   same pair, connector and window is reused.
    /// - A concurrent insert that loses the idempotency-key race re-reads and
    ///   returns the winning row.
    pub async fn schedule(&self, request: ScheduleSyncJob) -> Result<ScheduledJob, QueueError> {
        if request.window_start >= request.window_end {
            return Err(QueueError::InvalidWindow {
                start: request.window_start,
                end: request.window_end,
            });
        }

        let max_retries = request.max_retries.unwrap_or(self.default_max_retries);
        if max_retries < 1 {
            return Err(QueueError::InvalidMaxRetries { value: max_retries });
        }

        if let Some(ref key) = request.idempotency_key {
            if let Some(existing) = self.find_by_idempotency_key(key).await? {
                tracing::debug!(
                    job_id = %existing.id,
                    idempotency_key = %key,
                    "Returning existing sync job for idempotency key"
                );
                return Ok(ScheduledJob {
                    job: existing,
                    created: false,
                });
            }
        }

        if let Some(existing) = Entity::find()
            .filter(Column::PairId.eq(request.pair_id))
            .filter(Column::ConnectorId.eq(request.connector_id))
            .filter(Column::WindowStart.eq(request.window_start.fixed_offset()))
            .filter(Column::WindowEnd.eq(request.window_end.fixed_offset()))
            .filter(Column::Status.is_in(SyncJobStatus::ACTIVE))
            .order_by_asc(Column::CreatedAt)
            .one(&self.db)
            .await
            .map_err(db_context("failed to look up active sync job"))?
        {
            tracing::debug!(
                job_id = %existing.id,
                pair_id = %request.pair_id,
                "Returning active sync job for identical window"
            );
            return Ok(ScheduledJob {
                job: existing,
                created: false,
            });
        }

        let now = Utc::now().fixed_offset();
        let job = ActiveModel {
            id: Set(Uuid::new_v4()),
            pair_id: Set(request.pair_id),
            connector_id: Set(request.connector_id),
            window_start: Set(request.window_start.fixed_offset()),
            window_end: Set(request.window_end.fixed_offset()),
            payload: Set(request
                .payload
                .unwrap_or_else(|| JsonValue::Object(Default::default()))),
            status: Set(SyncJobStatus::Pending),
            priority: Set(request.priority.unwrap_or(0)),
            retry_count: Set(0),
            max_retries: Set(max_retries),
            next_run_at: Set(request.run_at.map(|t| t.fixed_offset()).unwrap_or(now)),
            last_error: Set(None),
            idempotency_key: Set(request.idempotency_key.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match job.insert(&self.db).await {
            Ok(job) => {
                tracing::info!(
                    job_id = %job.id,
                    pair_id = %job.pair_id,
                    connector_id = %job.connector_id,
                    priority = job.priority,
                    "Sync job scheduled"
                );
                Ok(ScheduledJob { job, created: true })
            }
            Err(err) if crate::error::is_unique_violation(&err) => {
                let key = request.idempotency_key.as_deref().unwrap_or_default();
                let winner = self
                    .find_by_idempotency_key(key)
                    .await?
                    .ok_or_else(|| QueueError::database("failed to schedule sync job", err))?;
                Ok(ScheduledJob {
                    job: winner,
                    created: false,
                })
            }
            Err(err) => Err(db_context("failed to schedule sync job")(err)),
        }
    }

    pub async fn find_by_id(&self, job_id: Uuid) -> Result<Option<Model>, QueueError> {
        Entity::find_by_id(job_id)
            .one(&self.db)
            .await
            .map_err(db_context("failed to find sync job"))
    }

    /// Like [`find_by_id`](Self::find_by_id) but treats a missing row as an error.
    pub async fn get(&self, job_id: Uuid) -> Result<Model, QueueError> {
        self.find_by_id(job_id)
            .await?
            .ok_or(QueueError::JobNotFound(job_id))
    }

    pub async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Model>, QueueError> {
        Entity::find()
            .filter(Column::IdempotencyKey.eq(key))
            .one(&self.db)
            .await
            .map_err(db_context("failed to find sync job by idempotency key"))
    }

    /// Attempt history for a job, oldest first.
    pub async fn logs_for_job(&self, job_id: Uuid) -> Result<Vec<SyncJobLogModel>, QueueError> {
        SyncJobLog::find()
            .filter(SyncJobLogColumn::JobId.eq(job_id))
            .order_by_asc(SyncJobLogColumn::StartedAt)
            .all(&self.db)
            .await
            .map_err(db_context("failed to list sync job logs"))
    }

    /// Number of jobs per status. Statuses without rows are absent.
    pub async fn count_by_status(&self) -> Result<HashMap<SyncJobStatus, u64>, QueueError> {
        let rows: Vec<(SyncJobStatus, i64)> = Entity::find()
            .select_only()
            .column(Column::Status)
            .column_as(Expr::col(Column::Id).count(), "count")
            .group_by(Column::Status)
            .into_tuple()
            .all(&self.db)
            .await
            .map_err(db_context("failed to count sync jobs by status"))?;

        Ok(rows
            .into_iter()
            .map(|(status, count)| (status, count.max(0) as u64))
            .collect())
    }

    pub async fn failure_stat(
        &self,
        connector_id: Uuid,
        pair_id: Uuid,
    ) -> Result<Option<FailureStatModel>, QueueError> {
        ConnectorFailureStat::find_by_id((connector_id, pair_id))
            .one(&self.db)
            .await
            .map_err(db_context("failed to load connector failure stat"))
    }

    /// Unacknowledged circuit-breaker alerts for a key.
    pub async fn open_circuit_breaker_alerts(
        &self,
        connector_id: Uuid,
        pair_id: Uuid,
    ) -> Result<Vec<AlertModel>, QueueError> {
        Alert::find()
            .filter(AlertColumn::Category.eq(AlertCategory::CircuitBreaker))
            .filter(AlertColumn::ConnectorId.eq(connector_id))
            .filter(AlertColumn::PairId.eq(pair_id))
            .filter(AlertColumn::Acknowledged.eq(false))
            .order_by_asc(AlertColumn::CreatedAt)
            .all(&self.db)
            .await
            .map_err(db_context("failed to list circuit breaker alerts"))
    }
}
