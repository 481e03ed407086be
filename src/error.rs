//! # Error Handling
//!
//! Error taxonomy for the job queue. Database failures carry a static
//! context naming the operation that failed so a tick-level log line is
//! enough to locate the problem.

use chrono::{DateTime, Utc};
use sea_orm::DbErr;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the queue consumer, failure tracker and scheduler.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A claim, finalize or scheduling round-trip failed. The surrounding
    /// transaction has been rolled back.
    #[error("{context}: {source}")]
    Database {
        context: &'static str,
        #[source]
        source: DbErr,
    },
    #[error("sync job {0} not found")]
    JobNotFound(Uuid),
    #[error("sync window start ({start}) must be before end ({end})")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("max retries must be at least 1, got {value}")]
    InvalidMaxRetries { value: i32 },
    #[error("telemetry refresh failed: {0}")]
    Telemetry(String),
}

impl QueueError {
    /// Wrap a `DbErr` with the operation that produced it.
    pub fn database(context: &'static str, source: DbErr) -> Self {
        QueueError::Database { context, source }
    }

    /// True when retrying the same transaction may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Database { source, .. } => is_transient(source),
            _ => false,
        }
    }

    /// True when the underlying failure is a unique-constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            QueueError::Database { source, .. } => is_unique_violation(source),
            _ => false,
        }
    }
}

/// Returns a closure mapping a `DbErr` into [`QueueError::Database`].
pub fn db_context(context: &'static str) -> impl FnOnce(DbErr) -> QueueError {
    move |source| {
        tracing::error!(error = ?source, context, "Database operation failed");
        QueueError::database(context, source)
    }
}

/// Detects unique-constraint violations on Postgres and SQLite.
pub fn is_unique_violation(error: &DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    match db_error.code() {
        Some(code) => {
            let code_str = code.as_ref();
            code_str == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code_str)
        }
        None => false,
    }
}

/// Detects serialization conflicts, deadlocks, busy databases and lost
/// connections.
pub fn is_transient(error: &DbErr) -> bool {
    use sea_orm::RuntimeErr;
    use sea_orm::sqlx::Error as SqlxError;

    // 40001 serialization_failure, 40P01 deadlock_detected
    const PG_TRANSIENT: &[&str] = &["40001", "40P01"];
    // SQLITE_BUSY, SQLITE_LOCKED, SQLITE_BUSY_SNAPSHOT
    const SQLITE_TRANSIENT: &[&str] = &["5", "6", "517"];

    let sqlx_err = match error {
        DbErr::ConnectionAcquire(_) | DbErr::Conn(_) => return true,
        DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        _ => return false,
    };

    match sqlx_err {
        SqlxError::Io(_) | SqlxError::PoolTimedOut | SqlxError::WorkerCrashed => true,
        SqlxError::Database(db_error) => db_error.code().is_some_and(|code| {
            PG_TRANSIENT.contains(&code.as_ref()) || SQLITE_TRANSIENT.contains(&code.as_ref())
        }),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_sqlx_errors_are_not_unique_violations() {
        assert!(!is_unique_violation(&DbErr::RecordNotFound(
            "sync_jobs".to_string()
        )));
        assert!(!is_unique_violation(&DbErr::Custom("boom".to_string())));
    }

    #[test]
    fn lost_connections_are_transient() {
        use sea_orm::{ConnAcquireErr, RuntimeErr};

        assert!(is_transient(&DbErr::ConnectionAcquire(ConnAcquireErr::Timeout)));
        assert!(is_transient(&DbErr::Conn(RuntimeErr::Internal(
            "connection closed".to_string()
        ))));
        assert!(!is_transient(&DbErr::Custom("bad input".to_string())));
        assert!(!QueueError::Telemetry("down".to_string()).is_transient());
    }

    #[test]
    fn database_error_display_includes_context() {
        let err = QueueError::database(
            "failed to claim next job",
            DbErr::Custom("connection reset".to_string()),
        );
        let rendered = err.to_string();
        assert!(rendered.starts_with("failed to claim next job"));
        assert!(rendered.contains("connection reset"));
        assert!(!err.is_unique_violation());
    }
}
