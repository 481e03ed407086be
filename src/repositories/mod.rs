//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations for the
//! queue tables outside the consumer's own transactions.

pub mod sync_job;

pub use sync_job::{ScheduleSyncJob, ScheduledJob, SyncJobRepository};
