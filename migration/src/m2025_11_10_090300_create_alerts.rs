//! Migration to create the alerts table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Alerts::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Alerts::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Alerts::Category).text().not_null())
                    .col(ColumnDef::new(Alerts::Severity).text().not_null())
                    .col(ColumnDef::new(Alerts::ConnectorId).uuid().not_null())
                    .col(ColumnDef::new(Alerts::PairId).uuid().not_null())
                    .col(ColumnDef::new(Alerts::Message).text().not_null())
                    .col(
                        ColumnDef::new(Alerts::Acknowledged)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(Alerts::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Alerts::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Open-alert lookup per (connector, pair)
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_alerts_category_key_acknowledged")
                    .table(Alerts::Table)
                    .col(Alerts::Category)
                    .col(Alerts::ConnectorId)
                    .col(Alerts::PairId)
                    .col(Alerts::Acknowledged)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_alerts_category_key_acknowledged")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Alerts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Alerts {
    Table,
    Id,
    Category,
    Severity,
    ConnectorId,
    PairId,
    Message,
    Acknowledged,
    CreatedAt,
    UpdatedAt,
}
