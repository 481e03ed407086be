//! # Failure Tracker / Circuit Breaker
//!
//! Maintains the per-(connector, pair) consecutive failure counter and the
//! pause window that keeps the consumer from claiming work for a key that
//! keeps failing. Both entry points take a generic connection so they run
//! inside the caller's finalize transaction.

use chrono::{DateTime, Duration, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter, Set,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{QueueError, db_context};
use crate::models::alert::{
    ActiveModel as AlertActiveModel, AlertCategory, AlertSeverity, Column as AlertColumn,
    Entity as Alert,
};
use crate::models::connector_failure_stat::{
    ActiveModel as FailureStatActiveModel, Column as FailureStatColumn,
    Entity as ConnectorFailureStat,
};

/// Thresholds governing when a key is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerPolicy {
    pub failure_threshold: i32,
    pub pause_window: Duration,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            pause_window: Duration::minutes(30),
        }
    }
}

/// Tracker state after a failure has been recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureState {
    pub consecutive_failures: i32,
    pub paused_until: Option<DateTime<Utc>>,
    /// True when this failure opened a new pause window
    pub opened: bool,
}

/// The tracker count never lags the job's own retry count for the same key.
pub fn reconcile_failures(stored: i32, new_retry_count: i32) -> i32 {
    stored.max(new_retry_count)
}

/// Whether a fresh pause window should start.
///
/// A pause that is still running is left alone; an expired one is renewed.
pub fn should_pause(
    consecutive_failures: i32,
    policy: &CircuitBreakerPolicy,
    paused_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if consecutive_failures < policy.failure_threshold {
        return false;
    }
    match paused_until {
        Some(until) => until <= now,
        None => true,
    }
}

fn alert_message(
    connector_id: Uuid,
    pair_id: Uuid,
    consecutive_failures: i32,
    paused_until: Option<DateTime<Utc>>,
) -> String {
    let mut message = format!(
        "Circuit breaker open for connector {connector_id} pair {pair_id} after {consecutive_failures} consecutive failures"
    );
    if let Some(until) = paused_until {
        message.push_str(&format!("; claiming paused until {}", until.to_rfc3339()));
    }
    message
}

/// Record one failed attempt for `(connector_id, pair_id)`.
///
/// Increments the counter (creating the row at 1), reconciles it against
/// `new_retry_count`, opens a pause window once the threshold is reached,
/// and keeps exactly one open circuit-breaker alert for the key.
pub async fn record_failure<C: ConnectionTrait>(
    conn: &C,
    policy: &CircuitBreakerPolicy,
    connector_id: Uuid,
    pair_id: Uuid,
    new_retry_count: i32,
    now: DateTime<Utc>,
) -> Result<FailureState, QueueError> {
    let db_now = now.fixed_offset();

    let seed = FailureStatActiveModel {
        connector_id: Set(connector_id),
        pair_id: Set(pair_id),
        consecutive_failures: Set(0),
        last_failure_at: Set(None),
        paused_until: Set(None),
        created_at: Set(db_now),
        updated_at: Set(db_now),
    };
    ConnectorFailureStat::insert(seed)
        .on_conflict(
            OnConflict::columns([FailureStatColumn::ConnectorId, FailureStatColumn::PairId])
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await
        .map_err(db_context("failed to create connector failure stat"))?;

    ConnectorFailureStat::update_many()
        .col_expr(
            FailureStatColumn::ConsecutiveFailures,
            Expr::col(FailureStatColumn::ConsecutiveFailures).add(1),
        )
        .col_expr(FailureStatColumn::LastFailureAt, Expr::value(Some(db_now)))
        .col_expr(FailureStatColumn::UpdatedAt, Expr::value(db_now))
        .filter(FailureStatColumn::ConnectorId.eq(connector_id))
        .filter(FailureStatColumn::PairId.eq(pair_id))
        .exec(conn)
        .await
        .map_err(db_context("failed to increment connector failure stat"))?;

    let stat = ConnectorFailureStat::find_by_id((connector_id, pair_id))
        .one(conn)
        .await
        .map_err(db_context("failed to load connector failure stat"))?
        .ok_or_else(|| {
            QueueError::database(
                "failed to load connector failure stat",
                DbErr::RecordNotFound(format!("{connector_id}/{pair_id}")),
            )
        })?;

    let stored = stat.consecutive_failures;
    let consecutive_failures = reconcile_failures(stored, new_retry_count);
    let current_pause = stat.paused_until.map(|until| until.with_timezone(&Utc));
    let opened = should_pause(consecutive_failures, policy, current_pause, now);
    let paused_until = if opened {
        Some(
            now.checked_add_signed(policy.pause_window)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    } else {
        current_pause
    };

    if consecutive_failures != stored || opened {
        let mut active: FailureStatActiveModel = stat.into();
        active.consecutive_failures = Set(consecutive_failures);
        active.paused_until = Set(paused_until.map(|until| until.fixed_offset()));
        active.updated_at = Set(db_now);
        active
            .update(conn)
            .await
            .map_err(db_context("failed to update connector failure stat"))?;
    }

    if consecutive_failures != stored {
        warn!(
            connector_id = %connector_id,
            pair_id = %pair_id,
            stored,
            consecutive_failures,
            "Reconciled failure counter with job retry count"
        );
    }

    if consecutive_failures >= policy.failure_threshold {
        let message = alert_message(connector_id, pair_id, consecutive_failures, paused_until);
        upsert_alert(conn, connector_id, pair_id, message, db_now).await?;

        if opened {
            warn!(
                connector_id = %connector_id,
                pair_id = %pair_id,
                consecutive_failures,
                paused_until = ?paused_until,
                "Circuit breaker opened"
            );
        }
    }

    Ok(FailureState {
        consecutive_failures,
        paused_until,
        opened,
    })
}

async fn upsert_alert<C: ConnectionTrait>(
    conn: &C,
    connector_id: Uuid,
    pair_id: Uuid,
    message: String,
    now: DateTimeWithTimeZone,
) -> Result<(), QueueError> {
    let existing = Alert::find()
        .filter(AlertColumn::Category.eq(AlertCategory::CircuitBreaker))
        .filter(AlertColumn::ConnectorId.eq(connector_id))
        .filter(AlertColumn::PairId.eq(pair_id))
        .filter(AlertColumn::Acknowledged.eq(false))
        .one(conn)
        .await
        .map_err(db_context("failed to look up circuit breaker alert"))?;

    match existing {
        Some(alert) => {
            let mut active: AlertActiveModel = alert.into();
            active.message = Set(message);
            active.updated_at = Set(now);
            active
                .update(conn)
                .await
                .map_err(db_context("failed to update circuit breaker alert"))?;
        }
        None => {
            let alert = AlertActiveModel {
                id: Set(Uuid::new_v4()),
                category: Set(AlertCategory::CircuitBreaker),
                severity: Set(AlertSeverity::Critical),
                connector_id: Set(connector_id),
                pair_id: Set(pair_id),
                message: Set(message),
                acknowledged: Set(false),
                created_at: Set(now),
                updated_at: Set(now),
            };
            alert
                .insert(conn)
                .await
                .map_err(db_context("failed to create circuit breaker alert"))?;
        }
    }

    Ok(())
}

/// Reset the tracker for a key after a successful attempt and acknowledge
/// any open circuit-breaker alert. Returns the number of alerts cleared.
pub async fn record_success<C: ConnectionTrait>(
    conn: &C,
    connector_id: Uuid,
    pair_id: Uuid,
    now: DateTime<Utc>,
) -> Result<u64, QueueError> {
    let db_now = now.fixed_offset();

    ConnectorFailureStat::update_many()
        .col_expr(FailureStatColumn::ConsecutiveFailures, Expr::value(0))
        .col_expr(
            FailureStatColumn::LastFailureAt,
            Expr::value(Option::<DateTimeWithTimeZone>::None),
        )
        .col_expr(
            FailureStatColumn::PausedUntil,
            Expr::value(Option::<DateTimeWithTimeZone>::None),
        )
        .col_expr(FailureStatColumn::UpdatedAt, Expr::value(db_now))
        .filter(FailureStatColumn::ConnectorId.eq(connector_id))
        .filter(FailureStatColumn::PairId.eq(pair_id))
        .exec(conn)
        .await
        .map_err(db_context("failed to reset connector failure stat"))?;

    let cleared = Alert::update_many()
        .col_expr(AlertColumn::Acknowledged, Expr::value(true))
        .col_expr(
            AlertColumn::Message,
            Expr::value(format!(
                "Circuit breaker cleared for connector {connector_id} pair {pair_id} after a successful sync"
            )),
        )
        .col_expr(AlertColumn::UpdatedAt, Expr::value(db_now))
        .filter(AlertColumn::Category.eq(AlertCategory::CircuitBreaker))
        .filter(AlertColumn::ConnectorId.eq(connector_id))
        .filter(AlertColumn::PairId.eq(pair_id))
        .filter(AlertColumn::Acknowledged.eq(false))
        .exec(conn)
        .await
        .map_err(db_context("failed to acknowledge circuit breaker alerts"))?
        .rows_affected;

    if cleared > 0 {
        info!(
            connector_id = %connector_id,
            pair_id = %pair_id,
            cleared,
            "Circuit breaker cleared"
        );
    }

    Ok(cleared)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconcile_never_lags_retry_count() {
        assert_eq!(reconcile_failures(1, 4), 4);
        assert_eq!(reconcile_failures(6, 2), 6);
        assert_eq!(reconcile_failures(3, 3), 3);
    }

    #[test]
    fn pause_requires_threshold() {
        let policy = CircuitBreakerPolicy::default();
        let now = Utc::now();
        assert!(!should_pause(4, &policy, None, now));
        assert!(should_pause(5, &policy, None, now));
        assert!(should_pause(9, &policy, None, now));
    }

    #[test]
    fn active_pause_is_not_extended() {
        let policy = CircuitBreakerPolicy::default();
        let now = Utc::now();
        assert!(!should_pause(
            6,
            &policy,
            Some(now + Duration::minutes(10)),
            now
        ));
        assert!(should_pause(
            6,
            &policy,
            Some(now - Duration::seconds(1)),
            now
        ));
    }

    #[test]
    fn alert_message_names_key_and_count() {
        let connector_id = Uuid::new_v4();
        let pair_id = Uuid::new_v4();
        let message = alert_message(connector_id, pair_id, 5, None);
        assert!(message.contains(&connector_id.to_string()));
        assert!(message.contains(&pair_id.to_string()));
        assert!(message.contains("5 consecutive failures"));
    }
}
