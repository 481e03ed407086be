//! Scheduling entry point: validation and de-duplication.

mod test_utils;

use anyhow::Result;
use calsync::error::QueueError;
use calsync::models::sync_job::SyncJobStatus;
use calsync::repositories::{ScheduleSyncJob, SyncJobRepository};
use chrono::{Duration, DurationRound, Utc};
use serde_json::json;
use test_utils::setup_test_db;
use uuid::Uuid;

fn window_request() -> ScheduleSyncJob {
    let start = Utc::now()
        .duration_trunc(Duration::hours(1))
        .expect("truncate to hour");
    ScheduleSyncJob::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        start,
        start + Duration::hours(24),
    )
}

#[tokio::test]
async fn schedule_applies_defaults() -> Result<()> {
    let db = setup_test_db().await?;
    let repo = SyncJobRepository::new(db.clone()).with_default_max_retries(7);

    let scheduled = repo.schedule(window_request()).await?;
    assert!(scheduled.created);

    let job = scheduled.job;
    assert_eq!(job.status, SyncJobStatus::Pending);
    assert_eq!(job.priority, 0);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.max_retries, 7);
    assert_eq!(job.payload, json!({}));
    assert!(job.next_run_at.with_timezone(&Utc) <= Utc::now());
    assert_eq!(job.idempotency_key, None);

    let counts = repo.count_by_status().await?;
    assert_eq!(counts.get(&SyncJobStatus::Pending), Some(&1));
    assert_eq!(counts.get(&SyncJobStatus::Completed), None);

    Ok(())
}

#[tokio::test]
async fn configured_default_max_retries_reaches_schedule() -> Result<()> {
    let db = setup_test_db().await?;
    let mut config = calsync::config::AppConfig::default();
    config.retry.default_max_retries = 9;
    let repo = SyncJobRepository::from_config(db.clone(), &config);

    let defaulted = repo.schedule(window_request()).await?;
    assert_eq!(defaulted.job.max_retries, 9);

    // An explicit request value still wins over the configured default.
    let mut explicit = window_request();
    explicit.max_retries = Some(2);
    let explicit = repo.schedule(explicit).await?;
    assert_eq!(explicit.job.max_retries, 2);

    Ok(())
}

#[tokio::test]
async fn same_idempotency_key_returns_existing_job() -> Result<()> {
    let db = setup_test_db().await?;
    let repo = SyncJobRepository::new(db.clone());

    let mut first_request = window_request();
    first_request.idempotency_key = Some("pair-42:2025-11-10".to_string());
    first_request.priority = Some(4);
    first_request.payload = Some(json!({ "type": "calendar.delta" }));

    // A different window with the same key still resolves to the first job.
    let mut second_request = window_request();
    second_request.idempotency_key = first_request.idempotency_key.clone();

    let first = repo.schedule(first_request).await?;
    let second = repo.schedule(second_request).await?;

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.job.id, second.job.id);
    assert_eq!(second.job.priority, 4);

    let counts = repo.count_by_status().await?;
    assert_eq!(counts.values().sum::<u64>(), 1);

    Ok(())
}

#[tokio::test]
async fn active_job_for_same_window_is_reused() -> Result<()> {
    let db = setup_test_db().await?;
    let repo = SyncJobRepository::new(db.clone());
    let request = window_request();

    let first = repo.schedule(request.clone()).await?;
    let second = repo.schedule(request.clone()).await?;
    assert_eq!(first.job.id, second.job.id);
    assert!(!second.created);

    // A different connector for the same pair is a separate job.
    let mut other_connector = request.clone();
    other_connector.connector_id = Uuid::new_v4();
    let third = repo.schedule(other_connector).await?;
    assert!(third.created);
    assert_ne!(third.job.id, first.job.id);

    Ok(())
}

#[tokio::test]
async fn terminal_job_does_not_block_rescheduling() -> Result<()> {
    use sea_orm::{ActiveModelTrait, Set};

    let db = setup_test_db().await?;
    let repo = SyncJobRepository::new(db.clone());
    let request = window_request();

    let first = repo.schedule(request.clone()).await?;
    let mut active: calsync::models::sync_job::ActiveModel = first.job.clone().into();
    active.status = Set(SyncJobStatus::Completed);
    active.update(&db).await?;

    let second = repo.schedule(request).await?;
    assert!(second.created);
    assert_ne!(second.job.id, first.job.id);

    Ok(())
}

#[tokio::test]
async fn rejects_inverted_window() -> Result<()> {
    let db = setup_test_db().await?;
    let repo = SyncJobRepository::new(db.clone());

    let mut request = window_request();
    std::mem::swap(&mut request.window_start, &mut request.window_end);

    let err = repo.schedule(request).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidWindow { .. }));
    assert!(repo.count_by_status().await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn rejects_non_positive_max_retries() -> Result<()> {
    let db = setup_test_db().await?;
    let repo = SyncJobRepository::new(db.clone());

    let mut request = window_request();
    request.max_retries = Some(0);

    let err = repo.schedule(request).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidMaxRetries { value: 0 }));

    Ok(())
}

#[tokio::test]
async fn missing_job_is_reported() -> Result<()> {
    let db = setup_test_db().await?;
    let repo = SyncJobRepository::new(db.clone());
    let id = Uuid::new_v4();

    assert!(repo.find_by_id(id).await?.is_none());
    assert!(matches!(
        repo.get(id).await,
        Err(QueueError::JobNotFound(missing)) if missing == id
    ));

    Ok(())
}
