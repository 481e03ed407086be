//! # Data Models
//!
//! SeaORM entities for the sync job queue tables.

pub mod alert;
pub mod connector_failure_stat;
pub mod sync_job;
pub mod sync_job_log;

pub use alert::Entity as Alert;
pub use connector_failure_stat::Entity as ConnectorFailureStat;
pub use sync_job::Entity as SyncJob;
pub use sync_job_log::Entity as SyncJobLog;
