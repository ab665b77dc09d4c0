#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
pub mod endpoints;
mod errors;
mod execution_log;
pub mod health;
mod job_registry;
mod runner;
mod scheduler;
/// Database schema definitions.
pub mod schema;
mod storage;
mod util;
mod worker;

/// The main trait for defining background jobs.
pub use self::background_job::{BackgroundJob, JobMeta};
/// Error types for job enqueueing and execution.
pub use self::errors::{EnqueueError, ExecutionError};
/// Execution log queries and the status projection.
pub use self::execution_log::{derive_status, entries_for, latest_status, list_entries};
/// The main runner that orchestrates job processing.
pub use self::runner::{RunHandle, Runner};
/// Timer-driven periodic job generation.
pub use self::scheduler::PeriodicSchedule;
/// Job queries for the surrounding application.
pub use self::storage::{JobQuery, get_job, list_jobs};

/// The health router, re-exported for convenience.
pub use self::endpoints::health_router;
/// The health aggregator and its standard probe set.
pub use self::health::{
    ActivityProbe, BrokerProbe, DataStoreProbe, HealthAggregator, HealthCheckResult, HealthProbe,
    HealthReport, QueueDepthProbe,
};

/// Embedded database migrations for the job and execution log tables.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Create or update the database schema this crate needs.
pub async fn setup_database(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await
}
