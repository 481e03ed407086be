//! SyncJob entity model
//!
//! This module contains the SeaORM entity model for the sync_jobs table,
//! which represents one bounded time-window synchronization task for a
//! calendar pair.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// SyncJob entity representing a schedulable unit of calendar sync work
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sync_jobs")]
pub struct Model {
    /// Unique identifier for the sync job (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Calendar pair this job synchronizes
    pub pair_id: Uuid,

    /// Connector (calendar account) the job runs against
    pub connector_id: Uuid,

    /// Inclusive start of the sync window
    pub window_start: DateTimeWithTimeZone,

    /// Exclusive end of the sync window
    pub window_end: DateTimeWithTimeZone,

    /// Opaque payload; `type` selects the executor
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,

    /// Lifecycle state, see [`SyncJobStatus`]
    pub status: SyncJobStatus,

    /// Job priority for claiming (higher values = claimed first)
    pub priority: i32,

    /// Number of failed attempts so far
    pub retry_count: i32,

    /// Ceiling for `retry_count`
    pub max_retries: i32,

    /// Earliest time the job may be claimed
    pub next_run_at: DateTimeWithTimeZone,

    /// Summary of the most recent failure
    pub last_error: Option<String>,

    /// Caller-supplied de-duplication token, unique when present
    #[sea_orm(unique)]
    pub idempotency_key: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

/// Job lifecycle states.
///
/// `pending` and `retrying` are claimable; `completed` and `failed` are terminal.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
pub enum SyncJobStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "in_progress")]
    InProgress,
    #[sea_orm(string_value = "retrying")]
    Retrying,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
}

impl SyncJobStatus {
    /// States a consumer may claim.
    pub const CLAIMABLE: [SyncJobStatus; 2] = [SyncJobStatus::Pending, SyncJobStatus::Retrying];

    /// States that still have work outstanding.
    pub const ACTIVE: [SyncJobStatus; 3] = [
        SyncJobStatus::Pending,
        SyncJobStatus::Retrying,
        SyncJobStatus::InProgress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncJobStatus::Pending => "pending",
            SyncJobStatus::InProgress => "in_progress",
            SyncJobStatus::Retrying => "retrying",
            SyncJobStatus::Completed => "completed",
            SyncJobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncJobStatus::Completed | SyncJobStatus::Failed)
    }
}

impl std::fmt::Display for SyncJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::sync_job_log::Entity")]
    SyncJobLog,
}

impl Related<super::sync_job_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::SyncJobLog.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// The `payload.type` discriminant, if present.
    pub fn payload_type(&self) -> Option<&str> {
        self.payload.get("type").and_then(JsonValue::as_str)
    }
}
