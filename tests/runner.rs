#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use claims::{assert_none, assert_some};
use rihanna::schema::Job;
use rihanna::{BackgroundJob, Config, DEFAULT_LOCK_CLASS_ID, Runner, clock};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::Barrier;

const CLASS_ID: i32 = DEFAULT_LOCK_CLASS_ID;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Set up a test database with `TestContainers` and return the pool and container
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let postgres_image = Postgres::default();
        let container = postgres_image.start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        rihanna::setup_database(&pool).await?;

        Ok((pool, container))
    }

    /// Create a test runner with common configuration
    pub(super) fn create_test_runner<Context: Clone + Send + Sync + 'static>(
        pool: PgPool,
        context: Context,
    ) -> Runner<Context> {
        Runner::new(pool, Config::default(), context)
            .num_workers(2)
            .shutdown_when_queue_empty()
    }
}

async fn remaining_jobs(pool: &PgPool) -> anyhow::Result<i64> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM rihanna_jobs")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

async fn job_exists(id: i32, pool: &PgPool) -> anyhow::Result<bool> {
    let result = sqlx::query_scalar::<_, Option<i32>>("SELECT id FROM rihanna_jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(result.is_some())
}

/// Whether some other session currently holds the job's advisory lock.
async fn job_is_locked(id: i32, pool: &PgPool) -> anyhow::Result<bool> {
    let mut conn = pool.acquire().await?;

    let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1, $2)")
        .bind(CLASS_ID)
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;

    if acquired {
        sqlx::query("SELECT pg_advisory_unlock($1, $2)")
            .bind(CLASS_ID)
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }

    Ok(!acquired)
}

async fn load_job(id: i32, pool: &PgPool) -> anyhow::Result<Job> {
    Ok(sqlx::query_as::<_, Job>(
        r"
        SELECT id, payload, enqueued_at, due_at, failed_at, fail_reason,
               priority, rihanna_internal_meta
        FROM rihanna_jobs
        WHERE id = $1
        ",
    )
    .bind(id)
    .fetch_one(pool)
    .await?)
}

#[tokio::test]
async fn setup_database_creates_the_job_table() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;

    let table_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM information_schema.tables
         WHERE table_name = 'rihanna_jobs' AND table_schema = 'public'",
    )
    .fetch_one(&pool)
    .await?;

    assert_eq!(table_count, 1);

    Ok(())
}

#[tokio::test]
async fn jobs_are_locked_while_running() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct TestContext {
        job_started_barrier: Arc<Barrier>,
        assertions_finished_barrier: Arc<Barrier>,
    }

    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const MODULE_NAME: &'static str = "test";
        type Context = TestContext;

        async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
            ctx.job_started_barrier.wait().await;
            ctx.assertions_finished_barrier.wait().await;
            Ok(())
        }
    }

    let test_context = TestContext {
        job_started_barrier: Arc::new(Barrier::new(2)),
        assertions_finished_barrier: Arc::new(Barrier::new(2)),
    };

    let (pool, _container) = test_utils::setup_test_db().await?;

    let runner = test_utils::create_test_runner(pool.clone(), test_context.clone())
        .register_job_type::<TestJob>();

    let job = TestJob.enqueue(&pool).await?;

    assert!(job_exists(job.id, &pool).await?);
    assert!(!job_is_locked(job.id, &pool).await?);

    let runner = runner.start();
    test_context.job_started_barrier.wait().await;

    assert!(job_exists(job.id, &pool).await?);
    assert!(job_is_locked(job.id, &pool).await?);

    test_context.assertions_finished_barrier.wait().await;
    runner.wait_for_shutdown().await;

    assert!(!job_exists(job.id, &pool).await?);

    Ok(())
}

#[tokio::test]
async fn jobs_are_deleted_when_successfully_run() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const MODULE_NAME: &'static str = "test";
        type Context = ();

        async fn run(&self, _ctx: Self::Context) -> anyhow::Result<()> {
            Ok(())
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let runner = test_utils::create_test_runner(pool.clone(), ()).register_job_type::<TestJob>();

    assert_eq!(remaining_jobs(&pool).await?, 0);

    TestJob.enqueue(&pool).await?;
    assert_eq!(remaining_jobs(&pool).await?, 1);

    let runner = runner.start();
    runner.wait_for_shutdown().await;
    assert_eq!(remaining_jobs(&pool).await?, 0);

    Ok(())
}

#[tokio::test]
async fn failing_jobs_are_marked_failed() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const MODULE_NAME: &'static str = "test";
        type Context = ();

        async fn run(&self, _ctx: Self::Context) -> anyhow::Result<()> {
            Err(anyhow!("boom"))
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let runner = test_utils::create_test_runner(pool.clone(), ()).register_job_type::<TestJob>();

    let job = TestJob.enqueue(&pool).await?;

    let runner = runner.start();
    runner.wait_for_shutdown().await;

    let reloaded = load_job(job.id, &pool).await?;
    assert_some!(reloaded.failed_at);
    let reason = assert_some!(reloaded.fail_reason.clone());
    assert!(reason.contains("boom"));
    assert_eq!(reloaded.attempts(), 0);
    assert!(!job_is_locked(job.id, &pool).await?);

    Ok(())
}

#[tokio::test]
async fn panicking_jobs_are_marked_failed() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const MODULE_NAME: &'static str = "test";
        type Context = ();

        async fn run(&self, _ctx: Self::Context) -> anyhow::Result<()> {
            panic!("kaboom")
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let runner = test_utils::create_test_runner(pool.clone(), ()).register_job_type::<TestJob>();

    let job = TestJob.enqueue(&pool).await?;

    let runner = runner.start();
    runner.wait_for_shutdown().await;

    let reloaded = load_job(job.id, &pool).await?;
    assert_some!(reloaded.failed_at);
    let reason = assert_some!(reloaded.fail_reason);
    assert!(reason.contains("job panicked: kaboom"));

    Ok(())
}

#[tokio::test]
async fn jobs_with_a_retry_schedule_are_rescheduled() -> anyhow::Result<()> {
    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const MODULE_NAME: &'static str = "test";
        type Context = ();

        async fn run(&self, _ctx: Self::Context) -> anyhow::Result<()> {
            Err(anyhow!("flaky"))
        }

        fn retry_at(&self, _error: &anyhow::Error, _attempts: i64) -> Option<DateTime<Utc>> {
            Some(clock::due_in(Duration::hours(1)))
        }
    }

    let (pool, _container) = test_utils::setup_test_db().await?;

    let runner = test_utils::create_test_runner(pool.clone(), ()).register_job_type::<TestJob>();

    let job = TestJob.enqueue(&pool).await?;
    assert_none!(job.due_at);

    let runner = runner.start();
    runner.wait_for_shutdown().await;

    let reloaded = load_job(job.id, &pool).await?;
    assert_none!(reloaded.failed_at);
    let due_at = assert_some!(reloaded.due_at);
    assert!(due_at > clock::now());
    assert_eq!(reloaded.attempts(), 1);
    assert!(!job_is_locked(job.id, &pool).await?);

    Ok(())
}

#[tokio::test]
async fn retried_jobs_run_again_when_due() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct TestContext {
        runs: Arc<AtomicU8>,
    }

    #[derive(Serialize, Deserialize)]
    struct TestJob;

    impl BackgroundJob for TestJob {
        const MODULE_NAME: &'static str = "test";
        type Context = TestContext;

        async fn run(&self, ctx: Self::Context) -> anyhow::Result<()> {
            ctx.runs.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("flaky"))
        }

        fn retry_at(&self, _error: &anyhow::Error, attempts: i64) -> Option<DateTime<Utc>> {
            // one immediate retry, then give up
            (attempts < 1).then(clock::now)
        }
    }

    let test_context = TestContext {
        runs: Arc::new(AtomicU8::new(0)),
    };

    let (pool, _container) = test_utils::setup_test_db().await?;

    let runner = test_utils::create_test_runner(pool.clone(), test_context.clone())
        .register_job_type::<TestJob>();

    let job = TestJob.enqueue(&pool).await?;

    let runner = runner.start();
    runner.wait_for_shutdown().await;

    assert_eq!(test_context.runs.load(Ordering::SeqCst), 2);

    let reloaded = load_job(job.id, &pool).await?;
    assert_some!(reloaded.failed_at);
    assert_eq!(reloaded.attempts(), 1);

    Ok(())
}
