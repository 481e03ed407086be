//! Migration to create the sync_job_logs table.
//!
//! One immutable row per processing attempt of a sync job.

use sea_orm_migration::prelude::*;

use super::m2025_11_10_090000_create_sync_jobs::SyncJobs;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncJobLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SyncJobLogs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SyncJobLogs::JobId).uuid().not_null())
                    .col(ColumnDef::new(SyncJobLogs::PairId).uuid().not_null())
                    .col(ColumnDef::new(SyncJobLogs::ConnectorId).uuid().not_null())
                    .col(
                        ColumnDef::new(SyncJobLogs::StartedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobLogs::FinishedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobLogs::ProcessedEvents)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobLogs::FailedEvents)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(SyncJobLogs::Outcome).text().not_null())
                    .col(ColumnDef::new(SyncJobLogs::ErrorSummary).text().null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sync_job_logs_job_id")
                            .from(SyncJobLogs::Table, SyncJobLogs::JobId)
                            .to(SyncJobs::Table, SyncJobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sync_job_logs_job_started")
                    .table(SyncJobLogs::Table)
                    .col(SyncJobLogs::JobId)
                    .col(SyncJobLogs::StartedAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_sync_job_logs_job_started").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(SyncJobLogs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SyncJobLogs {
    Table,
    Id,
    JobId,
    PairId,
    ConnectorId,
    StartedAt,
    FinishedAt,
    ProcessedEvents,
    FailedEvents,
    Outcome,
    ErrorSummary,
}
