//! Migration to create the connector_failure_stats table.
//!
//! Keyed by (connector_id, pair_id); drives the circuit breaker pause window.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ConnectorFailureStats::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ConnectorFailureStats::ConnectorId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConnectorFailureStats::PairId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConnectorFailureStats::ConsecutiveFailures)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ConnectorFailureStats::LastFailureAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ConnectorFailureStats::PausedUntil)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ConnectorFailureStats::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(ConnectorFailureStats::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .primary_key(
                        Index::create()
                            .name("pk_connector_failure_stats")
                            .col(ConnectorFailureStats::ConnectorId)
                            .col(ConnectorFailureStats::PairId),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ConnectorFailureStats::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ConnectorFailureStats {
    Table,
    ConnectorId,
    PairId,
    ConsecutiveFailures,
    LastFailureAt,
    PausedUntil,
    CreatedAt,
    UpdatedAt,
}
