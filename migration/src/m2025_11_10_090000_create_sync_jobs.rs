//! Migration to create the sync_jobs table.
//!
//! Each row is one bounded time-window synchronization task for a calendar
//! pair, claimed and finalized by queue workers.

use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::Statement;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SyncJobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SyncJobs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(SyncJobs::PairId).uuid().not_null())
                    .col(ColumnDef::new(SyncJobs::ConnectorId).uuid().not_null())
                    .col(
                        ColumnDef::new(SyncJobs::WindowStart)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::WindowEnd)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(SyncJobs::Payload).json_binary().not_null())
                    .col(
                        ColumnDef::new(SyncJobs::Status)
                            .text()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::Priority)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::MaxRetries)
                            .integer()
                            .not_null()
                            .default(5),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::NextRunAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(ColumnDef::new(SyncJobs::LastError).text().null())
                    .col(
                        ColumnDef::new(SyncJobs::IdempotencyKey)
                            .text()
                            .null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Claim path: status filter, due time, then priority DESC ordering
        manager
            .get_connection()
            .execute(Statement::from_string(
                manager.get_database_backend(),
                "CREATE INDEX IF NOT EXISTS idx_sync_jobs_status_next_run_priority ON sync_jobs (status, next_run_at, priority DESC)".to_string(),
            ))
            .await?;

        // Schedule de-duplication lookups
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sync_jobs_pair_connector_status")
                    .table(SyncJobs::Table)
                    .col(SyncJobs::PairId)
                    .col(SyncJobs::ConnectorId)
                    .col(SyncJobs::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_sync_jobs_status_next_run_priority")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_sync_jobs_pair_connector_status")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(SyncJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum SyncJobs {
    Table,
    Id,
    PairId,
    ConnectorId,
    WindowStart,
    WindowEnd,
    Payload,
    Status,
    Priority,
    RetryCount,
    MaxRetries,
    NextRunAt,
    LastError,
    IdempotencyKey,
    CreatedAt,
    UpdatedAt,
}
