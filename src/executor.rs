//! Job executor contract
//!
//! Executors perform the actual calendar sync work for one claimed job. The
//! consumer only sees the [`ExecutionResult`] they return; `Err` values and
//! panics are converted into failure results at the call boundary.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use tracing::{Span, warn};

use crate::models::sync_job::Model as SyncJob;
use crate::models::sync_job_log::SyncOutcome;

/// Collaborators handed to an executor alongside the job.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub db: DatabaseConnection,
    /// Span carrying the job's identifying fields
    pub span: Span,
}

/// Outcome reported by an executor for a single attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success {
        processed_events: i32,
        failed_events: i32,
    },
    Partial {
        processed_events: i32,
        failed_events: i32,
    },
    Failure {
        processed_events: i32,
        failed_events: i32,
        error_summary: String,
    },
}

impl ExecutionResult {
    pub fn success(processed_events: i32) -> Self {
        ExecutionResult::Success {
            processed_events,
            failed_events: 0,
        }
    }

    pub fn partial(processed_events: i32, failed_events: i32) -> Self {
        ExecutionResult::Partial {
            processed_events,
            failed_events,
        }
    }

    /// Failure with no events processed.
    pub fn failure(error_summary: impl Into<String>) -> Self {
        ExecutionResult::Failure {
            processed_events: 0,
            failed_events: 0,
            error_summary: error_summary.into(),
        }
    }

    pub fn outcome(&self) -> SyncOutcome {
        match self {
            ExecutionResult::Success { .. } => SyncOutcome::Success,
            ExecutionResult::Partial { .. } => SyncOutcome::Partial,
            ExecutionResult::Failure { .. } => SyncOutcome::Failure,
        }
    }

    pub fn processed_events(&self) -> i32 {
        match self {
            ExecutionResult::Success {
                processed_events, ..
            }
            | ExecutionResult::Partial {
                processed_events, ..
            }
            | ExecutionResult::Failure {
                processed_events, ..
            } => *processed_events,
        }
    }

    pub fn failed_events(&self) -> i32 {
        match self {
            ExecutionResult::Success { failed_events, .. }
            | ExecutionResult::Partial { failed_events, .. }
            | ExecutionResult::Failure { failed_events, .. } => *failed_events,
        }
    }

    pub fn error_summary(&self) -> Option<&str> {
        match self {
            ExecutionResult::Failure { error_summary, .. } => Some(error_summary),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, ExecutionResult::Failure { .. })
    }
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Run one attempt of `job`.
    ///
    /// Implementations should prefer returning [`ExecutionResult::Failure`]
    /// with a readable summary over returning `Err`.
    async fn execute(
        &self,
        job: &SyncJob,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<ExecutionResult>;
}

/// Dispatches jobs to executors keyed by `payload.type`.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn JobExecutor>>,
    fallback: Option<Arc<dyn JobExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor for a payload type, replacing any previous one.
    pub fn register(&mut self, job_type: impl Into<String>, executor: Arc<dyn JobExecutor>) {
        self.executors.insert(job_type.into(), executor);
    }

    /// Executor used when no type matches.
    pub fn with_fallback(mut self, executor: Arc<dyn JobExecutor>) -> Self {
        self.fallback = Some(executor);
        self
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.keys().cloned().collect();
        types.sort();
        types
    }

    fn resolve(&self, job: &SyncJob) -> Result<Arc<dyn JobExecutor>, String> {
        let job_type = job.payload_type();
        if let Some(executor) = job_type.and_then(|t| self.executors.get(t)) {
            return Ok(Arc::clone(executor));
        }
        match &self.fallback {
            Some(executor) => Ok(Arc::clone(executor)),
            None => Err(job_type.unwrap_or("<missing>").to_string()),
        }
    }
}

#[async_trait]
impl JobExecutor for ExecutorRegistry {
    async fn execute(
        &self,
        job: &SyncJob,
        ctx: &ExecutionContext,
    ) -> anyhow::Result<ExecutionResult> {
        match self.resolve(job) {
            Ok(executor) => executor.execute(job, ctx).await,
            Err(job_type) => {
                warn!(job_id = %job.id, job_type = %job_type, "No executor registered for job type");
                Ok(ExecutionResult::failure(format!(
                    "unsupported job type: {job_type}"
                )))
            }
        }
    }
}

/// Executor that reports success without doing any work.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExecutor;

impl NoopExecutor {
    pub const JOB_TYPE: &'static str = "noop";
}

#[async_trait]
impl JobExecutor for NoopExecutor {
    async fn execute(
        &self,
        _job: &SyncJob,
        _ctx: &ExecutionContext,
    ) -> anyhow::Result<ExecutionResult> {
        Ok(ExecutionResult::success(0))
    }
}
