#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod background_job;
/// UTC clock helpers.
pub mod clock;
mod config;
mod errors;
mod job_registry;
mod runner;
/// Database schema definitions.
pub mod schema;
/// Low-level operations on the job table.
pub mod storage;
mod util;
mod worker;

/// The main trait for defining background jobs.
pub use self::background_job::BackgroundJob;
/// Process-wide queue configuration.
pub use self::config::{Config, DEFAULT_LOCK_CLASS_ID};
/// Error types surfaced by the queue.
pub use self::errors::{EnqueueError, RetryFailedError};
/// The runner that claims and executes jobs.
pub use self::runner::Runner;
/// Options accepted when enqueueing a job.
pub use self::storage::EnqueueOptions;

/// Create the `rihanna_jobs` table and its claim index.
///
/// This is idempotent; call it once at startup, or manage the migration with
/// external tooling instead. Every other operation assumes the schema exists.
pub async fn setup_database(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
