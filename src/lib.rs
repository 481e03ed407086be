//! # calsync
//!
//! Sync job queue and execution engine: atomic job claiming, retry backoff,
//! a per-(connector, pair) circuit breaker and the worker process lifecycle.

pub mod backoff;
pub mod circuit_breaker;
pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod executor;
pub mod models;
pub mod repositories;
pub mod telemetry;
pub mod worker;
pub use migration;
