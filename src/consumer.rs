//! # Queue Consumer
//!
//! Claims due sync jobs one at a time, hands them to the [`JobExecutor`] and
//! finalizes the outcome. Claiming relies on `FOR UPDATE SKIP LOCKED` inside a
//! serializable transaction, so any number of worker processes can poll the
//! same table without an application-level lock.
//!
//! Each attempt finalizes in a single transaction that updates the job, writes
//! one `sync_job_logs` row and updates the per-(connector, pair) failure
//! tracker, so a crash mid-finalize leaves no partial writes behind. A finalize
//! that keeps failing releases the job back to `retrying` (or `failed`) rather
//! than leaving it `in_progress`.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use metrics::histogram;
use sea_orm::sea_query::{Expr, LockBehavior, LockType, Query};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    IsolationLevel, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::backoff::{self, BackoffOptions};
use crate::circuit_breaker::{self, CircuitBreakerPolicy};
use crate::config::AppConfig;
use crate::error::{QueueError, db_context};
use crate::executor::{ExecutionContext, ExecutionResult, JobExecutor};
use crate::models::connector_failure_stat::{
    Column as FailureStatColumn, Entity as ConnectorFailureStat,
};
use crate::models::sync_job::{
    ActiveModel as SyncJobActiveModel, Column as SyncJobColumn, Entity as SyncJob,
    Model as SyncJobModel, SyncJobStatus,
};
use crate::models::sync_job_log::ActiveModel as SyncJobLogActiveModel;
use crate::telemetry::Telemetry;

/// Finalize transactions tried per attempt before the job is released.
const FINALIZE_ATTEMPTS: u32 = 3;
const FINALIZE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Tunables for the queue consumer
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Sleep between ticks once the queue is drained
    pub poll_interval: Duration,
    pub backoff: BackoffOptions,
    pub circuit_breaker: CircuitBreakerPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5000),
            backoff: BackoffOptions::default(),
            circuit_breaker: CircuitBreakerPolicy::default(),
        }
    }
}

impl From<&AppConfig> for ConsumerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            poll_interval: config.worker.poll_interval(),
            backoff: config.retry.backoff_options(),
            circuit_breaker: config.circuit_breaker.policy(),
        }
    }
}

/// Single-process consumer of the `sync_jobs` queue.
pub struct QueueConsumer {
    db: DatabaseConnection,
    executor: Arc<dyn JobExecutor>,
    telemetry: Arc<dyn Telemetry>,
    config: ConsumerConfig,
    active: AtomicBool,
    ticking: AtomicBool,
    in_flight: AtomicBool,
    shutdown: CancellationToken,
}

impl QueueConsumer {
    pub fn new(
        db: DatabaseConnection,
        executor: Arc<dyn JobExecutor>,
        telemetry: Arc<dyn Telemetry>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            db,
            executor,
            telemetry,
            config,
            active: AtomicBool::new(true),
            ticking: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// True while a job is being claimed, executed or finalized.
    pub fn is_processing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stop starting new ticks. A job already executing runs to completion.
    pub fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            info!("Queue consumer stopping");
        }
        self.shutdown.cancel();
    }

    /// Poll until stopped: drain the queue, then sleep for the poll interval.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Queue consumer started"
        );

        while self.is_active() {
            match self.tick().await {
                Ok(processed) if processed > 0 => {
                    debug!(processed, "Queue drained");
                }
                Ok(_) => {}
                Err(err) => {
                    error!(error = ?err, "Queue consumer tick failed");
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(self.config.poll_interval) => {}
            }
        }

        info!("Queue consumer stopped");
    }

    /// Claim and process jobs until none are eligible, returning how many ran.
    ///
    /// Returns `Ok(0)` without touching the store when the consumer is stopped
    /// or another tick is already running. A database error ends the tick
    /// early; jobs processed before it are not rolled back.
    pub async fn tick(&self) -> Result<usize, QueueError> {
        if !self.is_active() {
            return Ok(0);
        }
        if self
            .ticking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Tick already in progress, skipping");
            return Ok(0);
        }
        let _ticking = scopeguard::guard(&self.ticking, |flag| flag.store(false, Ordering::SeqCst));

        let started = Instant::now();
        let mut processed = 0usize;

        let outcome = loop {
            if !self.is_active() {
                break Ok(processed);
            }

            self.in_flight.store(true, Ordering::SeqCst);
            let _in_flight =
                scopeguard::guard(&self.in_flight, |flag| flag.store(false, Ordering::SeqCst));

            let job = match self.claim_next_job().await {
                Ok(Some(job)) => job,
                Ok(None) => break Ok(processed),
                Err(err) => break Err(err),
            };

            if let Err(err) = self.process_job(job).await {
                break Err(err);
            }
            processed += 1;
        };

        histogram!("sync_consumer_tick_duration_ms").record(started.elapsed().as_secs_f64() * 1000.0);

        outcome
    }

    /// Atomically claim the highest-priority eligible job and mark it
    /// `in_progress`.
    ///
    /// Eligible means `pending` or `retrying`, due, and not paused by the
    /// circuit breaker for its (connector, pair).
    pub async fn claim_next_job(&self) -> Result<Option<SyncJobModel>, QueueError> {
        let now = Utc::now().fixed_offset();
        let txn = self.begin_serializable("failed to begin claim transaction").await?;

        let paused = Query::select()
            .expr(Expr::val(1))
            .from(ConnectorFailureStat)
            .and_where(
                Expr::col((ConnectorFailureStat, FailureStatColumn::ConnectorId))
                    .equals((SyncJob, SyncJobColumn::ConnectorId)),
            )
            .and_where(
                Expr::col((ConnectorFailureStat, FailureStatColumn::PairId))
                    .equals((SyncJob, SyncJobColumn::PairId)),
            )
            .and_where(Expr::col((ConnectorFailureStat, FailureStatColumn::PausedUntil)).is_not_null())
            .and_where(Expr::col((ConnectorFailureStat, FailureStatColumn::PausedUntil)).gt(now))
            .to_owned();

        let candidate = SyncJob::find()
            .filter(SyncJobColumn::Status.is_in(SyncJobStatus::CLAIMABLE))
            .filter(SyncJobColumn::NextRunAt.lte(now))
            .filter(Expr::exists(paused).not())
            .order_by_desc(SyncJobColumn::Priority)
            .order_by_asc(SyncJobColumn::NextRunAt)
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .one(&txn)
            .await
            .map_err(db_context("failed to claim next job"))?;

        let Some(job) = candidate else {
            txn.commit()
                .await
                .map_err(db_context("failed to commit empty claim"))?;
            return Ok(None);
        };

        let mut active: SyncJobActiveModel = job.into();
        active.status = Set(SyncJobStatus::InProgress);
        active.updated_at = Set(now);
        let claimed = active
            .update(&txn)
            .await
            .map_err(db_context("failed to mark job in progress"))?;

        txn.commit()
            .await
            .map_err(db_context("failed to commit job claim"))?;

        info!(
            job_id = %claimed.id,
            pair_id = %claimed.pair_id,
            connector_id = %claimed.connector_id,
            retry_count = claimed.retry_count,
            priority = claimed.priority,
            "Claimed sync job"
        );

        Ok(Some(claimed))
    }

    /// Execute one claimed job and finalize its outcome, returning the
    /// job's new status.
    ///
    /// Executor errors and panics become failure outcomes; only persistence
    /// errors are returned.
    pub async fn process_job(&self, job: SyncJobModel) -> Result<SyncJobStatus, QueueError> {
        let span = info_span!(
            "sync_job",
            job_id = %job.id,
            pair_id = %job.pair_id,
            connector_id = %job.connector_id,
            retry_count = job.retry_count,
        );

        self.in_flight.store(true, Ordering::SeqCst);
        let _in_flight =
            scopeguard::guard(&self.in_flight, |flag| flag.store(false, Ordering::SeqCst));

        self.process_in_span(job, span.clone()).instrument(span).await
    }

    async fn process_in_span(
        &self,
        job: SyncJobModel,
        span: Span,
    ) -> Result<SyncJobStatus, QueueError> {
        let started_at = Utc::now();
        let timer = Instant::now();

        let result = self.execute(&job, span).await;

        let finished_at = Utc::now();
        let elapsed = timer.elapsed().as_secs_f64();
        self.telemetry.observe_job_duration(result.outcome(), elapsed);

        match self.finalize(&job, &result, started_at, finished_at).await {
            Ok(status) => Ok(status),
            Err(err) => {
                self.release_unfinalized(&job, &result, &err, started_at)
                    .await;
                Err(err)
            }
        }
    }

    /// Finalize the attempt, retrying the whole transaction on serialization
    /// conflicts and lost connections.
    async fn finalize(
        &self,
        job: &SyncJobModel,
        result: &ExecutionResult,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<SyncJobStatus, QueueError> {
        let mut attempt = 1u32;
        loop {
            let finalized = if result.is_failure() {
                self.finalize_failure(job, result, started_at, finished_at)
                    .await
            } else {
                self.finalize_success(job, result, started_at, finished_at)
                    .await
            };

            match finalized {
                Err(err) if err.is_transient() && attempt < FINALIZE_ATTEMPTS => {
                    warn!(attempt, error = %err, "Finalize transaction failed, retrying");
                    sleep(FINALIZE_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Return a job whose finalize failed to a claimable (or terminal) state.
    ///
    /// The attempt is counted as a failure with backoff. The log row is written
    /// in the same transaction when possible; if that transaction fails too the
    /// job row is released on its own so it never stays `in_progress`.
    async fn release_unfinalized(
        &self,
        job: &SyncJobModel,
        result: &ExecutionResult,
        cause: &QueueError,
        started_at: DateTime<Utc>,
    ) {
        let now = Utc::now();
        let new_retry_count = job.retry_count + 1;
        let reached_max = new_retry_count >= job.max_retries;
        let status = if reached_max {
            SyncJobStatus::Failed
        } else {
            SyncJobStatus::Retrying
        };
        let summary = format!("finalize failed: {cause}");

        let mut active: SyncJobActiveModel = job.clone().into();
        active.status = Set(status);
        active.retry_count = Set(new_retry_count);
        if !reached_max {
            let attempt = u32::try_from(new_retry_count).unwrap_or(1);
            let next_run_at = backoff::next_run_at(attempt, now, &self.config.backoff);
            active.next_run_at = Set(next_run_at.fixed_offset());
        }
        active.last_error = Set(Some(summary.clone()));
        active.updated_at = Set(now.fixed_offset());

        let released_result = ExecutionResult::Failure {
            processed_events: result.processed_events(),
            failed_events: result.failed_events(),
            error_summary: summary,
        };

        let logged: Result<(), QueueError> = async {
            let txn = self
                .begin_serializable("failed to begin release transaction")
                .await?;
            active
                .clone()
                .update(&txn)
                .await
                .map_err(db_context("failed to release unfinalized job"))?;
            insert_attempt_log(&txn, job, &released_result, started_at, now).await?;
            txn.commit()
                .await
                .map_err(db_context("failed to commit job release"))
        }
        .await;

        if let Err(log_err) = logged {
            warn!(error = %log_err, "Could not log released attempt, releasing job row only");
            if let Err(release_err) = active.update(&self.db).await {
                error!(
                    error = %release_err,
                    "Failed to release job after finalize error; it stays in_progress"
                );
                return;
            }
        }

        warn!(
            status = %status,
            retry_count = new_retry_count,
            "Released sync job after finalize error"
        );
        self.telemetry.record_job_status(status, job.connector_id);
        if !reached_max {
            self.telemetry.record_retry(job.connector_id);
        }
    }

    /// Run the executor on its own task so a panic cannot unwind the consumer.
    async fn execute(&self, job: &SyncJobModel, span: Span) -> ExecutionResult {
        let executor = Arc::clone(&self.executor);
        let ctx = ExecutionContext {
            db: self.db.clone(),
            span: span.clone(),
        };
        let owned_job = job.clone();

        let handle = tokio::spawn(
            async move { executor.execute(&owned_job, &ctx).await }.instrument(span),
        );

        match handle.await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                warn!(error = %err, "Job executor returned an error");
                ExecutionResult::failure(err.to_string())
            }
            Err(join_err) if join_err.is_panic() => {
                let message = panic_message(join_err.into_panic());
                error!(panic = %message, "Job executor panicked");
                ExecutionResult::failure(message)
            }
            Err(join_err) => {
                error!(error = %join_err, "Job executor task was cancelled");
                ExecutionResult::failure("job executor task was cancelled")
            }
        }
    }

    async fn finalize_success(
        &self,
        job: &SyncJobModel,
        result: &ExecutionResult,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<SyncJobStatus, QueueError> {
        let txn = self
            .begin_serializable("failed to begin finalize success transaction")
            .await?;

        let mut active: SyncJobActiveModel = job.clone().into();
        active.status = Set(SyncJobStatus::Completed);
        active.last_error = Set(None);
        active.updated_at = Set(finished_at.fixed_offset());
        active
            .update(&txn)
            .await
            .map_err(db_context("failed to mark job completed"))?;

        insert_attempt_log(&txn, job, result, started_at, finished_at).await?;

        circuit_breaker::record_success(&txn, job.connector_id, job.pair_id, finished_at).await?;

        txn.commit()
            .await
            .map_err(db_context("failed to commit finalize success"))?;

        info!(
            outcome = %result.outcome(),
            processed_events = result.processed_events(),
            failed_events = result.failed_events(),
            "Sync job completed"
        );

        self.telemetry
            .record_job_status(SyncJobStatus::Completed, job.connector_id);
        if let Err(err) = self.telemetry.refresh_queue_depth().await {
            warn!(error = ?err, "Failed to refresh queue depth");
        }

        Ok(SyncJobStatus::Completed)
    }

    async fn finalize_failure(
        &self,
        job: &SyncJobModel,
        result: &ExecutionResult,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<SyncJobStatus, QueueError> {
        let new_retry_count = job.retry_count + 1;
        let reached_max = new_retry_count >= job.max_retries;
        let status = if reached_max {
            SyncJobStatus::Failed
        } else {
            SyncJobStatus::Retrying
        };
        let error_summary = result.error_summary().unwrap_or_default().to_string();

        let txn = self
            .begin_serializable("failed to begin finalize failure transaction")
            .await?;

        let mut active: SyncJobActiveModel = job.clone().into();
        active.status = Set(status);
        active.retry_count = Set(new_retry_count);
        if !reached_max {
            let attempt = u32::try_from(new_retry_count).unwrap_or(1);
            let next_run_at = backoff::next_run_at(attempt, finished_at, &self.config.backoff);
            active.next_run_at = Set(next_run_at.fixed_offset());
        }
        active.last_error = Set(Some(error_summary.clone()));
        active.updated_at = Set(finished_at.fixed_offset());
        let updated = active
            .update(&txn)
            .await
            .map_err(db_context("failed to record job failure"))?;

        insert_attempt_log(&txn, job, result, started_at, finished_at).await?;

        let tracker = circuit_breaker::record_failure(
            &txn,
            &self.config.circuit_breaker,
            job.connector_id,
            job.pair_id,
            new_retry_count,
            finished_at,
        )
        .await?;

        txn.commit()
            .await
            .map_err(db_context("failed to commit finalize failure"))?;

        warn!(
            status = %status,
            retry_count = new_retry_count,
            max_retries = job.max_retries,
            next_run_at = %updated.next_run_at,
            consecutive_failures = tracker.consecutive_failures,
            error = %error_summary,
            "Sync job failed"
        );

        self.telemetry.record_job_status(status, job.connector_id);
        if !reached_max {
            self.telemetry.record_retry(job.connector_id);
        }

        Ok(status)
    }

    async fn begin_serializable(
        &self,
        context: &'static str,
    ) -> Result<DatabaseTransaction, QueueError> {
        self.db
            .begin_with_config(Some(IsolationLevel::Serializable), None)
            .await
            .map_err(db_context(context))
    }
}

async fn insert_attempt_log(
    txn: &DatabaseTransaction,
    job: &SyncJobModel,
    result: &ExecutionResult,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> Result<Uuid, QueueError> {
    let log = SyncJobLogActiveModel {
        id: Set(Uuid::new_v4()),
        job_id: Set(job.id),
        pair_id: Set(job.pair_id),
        connector_id: Set(job.connector_id),
        started_at: Set(started_at.fixed_offset()),
        finished_at: Set(finished_at.fixed_offset()),
        processed_events: Set(result.processed_events()),
        failed_events: Set(result.failed_events()),
        outcome: Set(result.outcome()),
        error_summary: Set(result.error_summary().map(str::to_string)),
    };

    let inserted = log
        .insert(txn)
        .await
        .map_err(db_context("failed to insert sync job log"))?;

    Ok(inserted.id)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "job executor panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("kaboom"))), "kaboom");
        assert_eq!(panic_message(Box::new(7u8)), "job executor panicked");
    }

    #[test]
    fn consumer_config_follows_app_config() {
        let mut app = AppConfig::default();
        app.worker.poll_interval_ms = 250;
        app.circuit_breaker.failure_threshold = 3;

        let config = ConsumerConfig::from(&app);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.backoff.jitter_ratio, 0.1);
    }
}
