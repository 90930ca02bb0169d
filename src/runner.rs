use crate::BackgroundJob;
use crate::config::Config;
use crate::job_registry::JobRegistry;
use crate::worker::Worker;
use futures_util::future::join_all;
use sqlx::PgPool;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// Marker type for a runner with at least one registered job module
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Configured;
/// Marker type for a runner without registered job modules
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Unconfigured;

/// The core runner responsible for claiming and running jobs
pub struct Runner<Context: Clone + Send + Sync + 'static, State = Unconfigured> {
    connection_pool: PgPool,
    config: Config,
    job_registry: JobRegistry<Context>,
    context: Context,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    shutdown_when_queue_empty: bool,
    _state: PhantomData<State>,
}

impl<Context: std::fmt::Debug + Clone + Sync + Send, State: std::fmt::Debug> std::fmt::Debug
    for Runner<Context, State>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .field("modules", &self.job_registry.module_names())
            .field("context", &self.context)
            .field("num_workers", &self.num_workers)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner with the given connection pool, configuration and context.
    pub fn new(connection_pool: PgPool, config: Config, context: Context) -> Self {
        Self {
            connection_pool,
            config,
            job_registry: JobRegistry::default(),
            context,
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            shutdown_when_queue_empty: false,
            _state: PhantomData,
        }
    }
}

impl<Context: Clone + Send + Sync + 'static, State> Runner<Context, State> {
    /// Register a job module to run on this queue.
    pub fn register_job_type<J: BackgroundJob<Context = Context>>(
        mut self,
    ) -> Runner<Context, Configured> {
        self.job_registry.register::<J>();

        Runner {
            connection_pool: self.connection_pool,
            config: self.config,
            job_registry: self.job_registry,
            context: self.context,
            num_workers: self.num_workers,
            poll_interval: self.poll_interval,
            jitter: self.jitter,
            shutdown_when_queue_empty: self.shutdown_when_queue_empty,
            _state: PhantomData,
        }
    }

    /// Set the number of workers claiming from the queue.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how often workers poll for new jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the maximum random jitter to add to poll intervals.
    ///
    /// Jitter helps reduce thundering herd effects when multiple workers
    /// are polling for jobs simultaneously. The actual jitter applied will
    /// be a random value between 0 and the specified duration.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the runner to shut down when the job queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context, Configured> {
    /// Start the background workers.
    ///
    /// This returns a [`RunHandle`] which can be used to wait for the workers to shut down.
    pub fn start(&self) -> RunHandle {
        let job_registry = Arc::new(self.job_registry.clone());

        let mut handles = Vec::new();
        for i in 1..=self.num_workers {
            let name = format!("rihanna-worker-{i}");
            info!(worker.name = %name, "Starting worker…");

            let worker = Worker {
                connection_pool: self.connection_pool.clone(),
                lock_class_id: self.config.pg_advisory_lock_class_id,
                context: self.context.clone(),
                job_registry: job_registry.clone(),
                shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                poll_interval: self.poll_interval,
                jitter: self.jitter,
            };

            let span = info_span!("worker", worker.name = %name);
            let handle = tokio::spawn(async move { worker.run().instrument(span).await });

            handles.push(handle);
        }

        RunHandle { handles }
    }
}

/// Handle to a running job processing system
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
}

impl RunHandle {
    /// Wait for all background workers to shut down.
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Background worker task panicked");
            }
        });
    }
}
