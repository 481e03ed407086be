//! Database migrations for the calendar sync job queue.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2025_11_10_090000_create_sync_jobs;
mod m2025_11_10_090100_create_sync_job_logs;
mod m2025_11_10_090200_create_connector_failure_stats;
mod m2025_11_10_090300_create_alerts;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_11_10_090000_create_sync_jobs::Migration),
            Box::new(m2025_11_10_090100_create_sync_job_logs::Migration),
            Box::new(m2025_11_10_090200_create_connector_failure_stats::Migration),
            Box::new(m2025_11_10_090300_create_alerts::Migration),
        ]
    }
}
