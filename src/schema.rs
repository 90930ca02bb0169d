//! Database schema definitions for SQLx.
//!
//! This module contains the database types and structures for the job queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;
use sqlx::types::Json;

/// Priority assigned to jobs that do not specify one.
///
/// Lower numbers run first; 1 is "highest" by convention.
pub const DEFAULT_PRIORITY: i32 = 50;

/// Represents a job record in the `rihanna_jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier for the job, doubling as the advisory-lock object id.
    pub id: i32,
    /// The work to perform. The store itself never interprets this value.
    pub payload: Json<JobPayload>,
    /// When the job was enqueued. Reset by a successful `retry_failed`.
    pub enqueued_at: DateTime<Utc>,
    /// Earliest moment the job may run. `None` means immediately.
    pub due_at: Option<DateTime<Utc>>,
    /// When the job failed terminally, if it has.
    pub failed_at: Option<DateTime<Utc>>,
    /// Human-readable failure description, present exactly when `failed_at` is.
    pub fail_reason: Option<String>,
    /// Priority of the job (lower = runs first).
    pub priority: i32,
    /// Internal bookkeeping carried alongside the payload.
    #[sqlx(rename = "rihanna_internal_meta")]
    pub meta: Json<JobMeta>,
}

impl Job {
    /// Number of times this job has been retried.
    pub fn attempts(&self) -> i64 {
        self.meta.attempts
    }
}

/// The persisted work description.
///
/// Either a `(module, argument)` pair dispatched through the job registry, or
/// an opaque term stored on behalf of an external consumer. The store treats
/// both as uninterpreted data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobPayload {
    /// A registered job module plus its serialized argument.
    Module {
        /// Module name, see [`BackgroundJob::MODULE_NAME`](crate::BackgroundJob::MODULE_NAME).
        module: String,
        /// Serialized argument handed back to the module at run time.
        arg: Value,
    },
    /// An opaque term the queue stores without interpreting.
    Opaque(Value),
}

/// Contents of the `rihanna_internal_meta` column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMeta {
    /// Number of retry attempts. Only `mark_retried` increments this.
    #[serde(default)]
    pub attempts: i64,
    /// Reserved for future bookkeeping keys.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
