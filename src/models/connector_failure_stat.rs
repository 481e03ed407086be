//! ConnectorFailureStat entity model
//!
//! Consecutive-failure aggregate keyed by (connector_id, pair_id). A row with
//! an unexpired `paused_until` blocks claiming for that key.

use chrono::{DateTime, Utc};
use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "connector_failure_stats")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub connector_id: Uuid,

    #[sea_orm(primary_key, auto_increment = false)]
    pub pair_id: Uuid,

    pub consecutive_failures: i32,

    pub last_failure_at: Option<DateTimeWithTimeZone>,

    pub paused_until: Option<DateTimeWithTimeZone>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Whether claiming is currently blocked for this key.
    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.paused_until
            .map(|until| until.with_timezone(&Utc) > now)
            .unwrap_or(false)
    }
}
