use crate::job_registry::JobRegistry;
use crate::schema::JobPayload;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use crate::{clock, storage};
use anyhow::anyhow;
use futures_util::FutureExt;
use rand::Rng;
use sentry_core::{Hub, SentryFutureExt};
use sqlx::{Connection, PgPool};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info_span, trace, warn};

pub(crate) struct Worker<Context> {
    pub(crate) connection_pool: PgPool,
    pub(crate) lock_class_id: i32,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
}

impl<Context: Clone + Send + Sync + 'static> Worker<Context> {
    /// Calculate the sleep duration with random jitter applied.
    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }

        let jitter_millis = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.poll_interval + Duration::from_millis(random_jitter)
    }

    /// Run jobs forever, or until the queue is empty if `shutdown_when_queue_empty` is set.
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run(&self) {
        loop {
            match self.run_next_job().await {
                Ok(Some(_)) => {}
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No claimable jobs found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No claimable jobs found. Polling again in {sleep_duration:?}…");
                    sleep(sleep_duration).await;
                }
                Err(error) => {
                    error!("Failed to run job: {error}");
                    sleep(self.sleep_duration_with_jitter()).await;
                }
            }
        }
    }

    /// Claim and run the next job in the queue, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was run
    /// - `Ok(None)` if no claimable jobs were waiting
    /// - `Err(...)` if there was an error claiming or resolving the job
    #[allow(clippy::cognitive_complexity)]
    async fn run_next_job(&self) -> anyhow::Result<Option<i32>> {
        let context = self.context.clone();
        let job_registry = self.job_registry.clone();

        trace!("Looking for the next claimable job…");

        // The advisory lock taken by the claim lives on this connection's
        // session; the connection stays checked out until a terminal
        // transition resolves the job.
        let mut conn = self.connection_pool.acquire().await?;

        let claimed = storage::lock(&mut conn, self.lock_class_id, 1, &[]).await?;
        let Some(job) = claimed.into_iter().next() else {
            return Ok(None);
        };
        let job_id = job.id;

        let (module, arg) = match &job.payload.0 {
            JobPayload::Module { module, arg } => (module.clone(), arg.clone()),
            JobPayload::Opaque(_) => {
                warn!(job.id = %job_id, "Claimed a job with an opaque payload; marking it failed");
                let reason = "no module registered for opaque payload";
                storage::mark_failed(&mut conn, self.lock_class_id, &job, clock::now(), reason)
                    .await?;
                return Ok(Some(job_id));
            }
        };

        let span = info_span!("job", job.id = %job_id, job.module = %module);
        debug!("Running job…");

        let future = with_sentry_transaction(&module, async || {
            let run_task_fn = job_registry
                .get(&module)
                .ok_or_else(|| anyhow!("Unknown job module {module}"))?;

            AssertUnwindSafe(run_task_fn(context, arg.clone()))
                .catch_unwind()
                .await
                .map_err(|e| try_to_extract_panic_info(&*e))
                // TODO: Replace with flatten() once that stabilizes
                .and_then(std::convert::identity)
        });

        let result = future
            .instrument(span.clone())
            .bind_hub(Hub::current())
            .await;

        let terminal = async {
            match result {
                Ok(()) => {
                    debug!("Deleting successful job…");
                    storage::mark_successful(&mut conn, self.lock_class_id, &job).await
                }
                Err(error) => {
                    match job_registry.retry_at(&module, &error, &arg, job.attempts()) {
                        Some(due_at) => {
                            warn!("Failed to run job, retrying at {due_at}: {error:#}");
                            storage::mark_retried(&mut conn, self.lock_class_id, &job, due_at)
                                .await
                        }
                        None => {
                            warn!("Failed to run job: {error:#}");
                            let reason = format!("{error:#}");
                            storage::mark_failed(
                                &mut conn,
                                self.lock_class_id,
                                &job,
                                clock::now(),
                                &reason,
                            )
                            .await
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;

        if let Err(error) = terminal {
            // The advisory lock may still be dangling on this session. Close
            // the connection instead of returning it to the pool, so the
            // database releases every lock the session holds.
            let _ = conn.detach().close().await;
            return Err(error.into());
        }

        Ok(Some(job_id))
    }
}
