use crate::errors::EnqueueError;
use crate::schema::{DEFAULT_PRIORITY, Job, JobPayload};
use crate::storage::{self, EnqueueOptions};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::PgPool;
use std::future::Future;
use tracing::instrument;

/// Trait for defining background jobs that can be enqueued and executed asynchronously.
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the job module.
    ///
    /// This MUST be unique for the whole application.
    const MODULE_NAME: &'static str;

    /// Default priority of the job; lower numbers run first.
    ///
    /// [`Self::enqueue_with_options`] can be used to override the priority value.
    const PRIORITY: i32 = DEFAULT_PRIORITY;

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// Execute the job. This method should define its logic.
    fn run(&self, ctx: Self::Context) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// When should this job next run, after failing with `error` on its
    /// `attempts`-th retry?
    ///
    /// The default declines to answer, which leaves failed runs to be marked
    /// failed terminally. Returning a timestamp schedules a retry instead; a
    /// timestamp in the past makes the job immediately eligible again.
    fn retry_at(&self, _error: &anyhow::Error, _attempts: i64) -> Option<DateTime<Utc>> {
        None
    }

    /// Enqueue this job for background execution, due immediately.
    ///
    /// Returns the inserted job record.
    #[instrument(name = "rihanna.enqueue", skip(self, pool), fields(message = Self::MODULE_NAME))]
    fn enqueue<'a>(&'a self, pool: &'a PgPool) -> BoxFuture<'a, Result<Job, EnqueueError>> {
        self.enqueue_with_options(pool, EnqueueOptions::default())
    }

    /// Enqueue this job with an explicit due time and/or priority override.
    #[instrument(name = "rihanna.enqueue", skip(self, pool, options), fields(message = Self::MODULE_NAME))]
    fn enqueue_with_options<'a>(
        &'a self,
        pool: &'a PgPool,
        options: EnqueueOptions,
    ) -> BoxFuture<'a, Result<Job, EnqueueError>> {
        let arg = match serde_json::to_value(self) {
            Ok(arg) => arg,
            Err(err) => return async move { Err(EnqueueError::SerializationError(err)) }.boxed(),
        };

        let payload = JobPayload::Module {
            module: Self::MODULE_NAME.to_string(),
            arg,
        };
        let options = EnqueueOptions {
            priority: options.priority.or(Some(Self::PRIORITY)),
            ..options
        };

        async move { Ok(storage::enqueue(pool, &payload, &options).await?) }.boxed()
    }
}
