//! Infrastructure for the document job-processing core: job queue, transaction
//! core, worker pool, metrics, shutdown, configuration and Postgres schema.

pub mod config;
pub mod jobs;
pub mod metrics;
pub mod schema;
pub mod shutdown;
pub mod transaction;
