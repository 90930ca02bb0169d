//! Low-level operations on the `rihanna_jobs` table.
//!
//! Everything here is a thin wrapper around a handful of SQL statements. The
//! claim protocol relies on session-scoped advisory locks: [`lock`] acquires
//! `(class_id, job_id)` on the calling connection's session and exactly one
//! of the `mark_*` transitions releases it again, so those functions take a
//! [`PgConnection`] rather than a pool. [`enqueue`] and [`retry_failed`] have
//! no session affinity and accept any executor.

use crate::errors::RetryFailedError;
use crate::schema::{DEFAULT_PRIORITY, Job, JobPayload};
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use sqlx::postgres::PgExecutor;
use sqlx::types::Json;
use tracing::warn;

/// Options accepted by [`enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Earliest moment the job may run. `None` means immediately.
    pub due_at: Option<DateTime<Utc>>,
    /// Priority override. `None` falls back to [`DEFAULT_PRIORITY`].
    pub priority: Option<i32>,
}

/// Insert a new job row and return the stored record.
pub async fn enqueue<'e>(
    executor: impl PgExecutor<'e>,
    payload: &JobPayload,
    options: &EnqueueOptions,
) -> Result<Job, sqlx::Error> {
    sqlx::query_as::<_, Job>(
        r"
        INSERT INTO rihanna_jobs (payload, priority, due_at)
        VALUES ($1, $2, $3)
        RETURNING id, payload, enqueued_at, due_at, failed_at, fail_reason,
                  priority, rihanna_internal_meta
        ",
    )
    .bind(Json(payload))
    .bind(options.priority.unwrap_or(DEFAULT_PRIORITY))
    .bind(options.due_at)
    .fetch_one(executor)
    .await
}

// Selection, `FOR UPDATE SKIP LOCKED` and the advisory-lock try are colocated
// in one statement so two sessions can never both observe and then both claim
// the same row. The recursive CTE walks candidates one at a time in claim
// order (keyset pagination over the same composite key the index covers);
// a row whose advisory lock is already taken elsewhere fails the
// `pg_try_advisory_lock` projection and is stepped over instead of shadowing
// the candidates behind it. `due_at` is folded to `-infinity` when absent so
// unscheduled jobs sort first and the keyset comparison stays total.
const LOCK_JOBS: &str = r"
    WITH RECURSIVE candidates AS (
        (
            SELECT (j).*, pg_try_advisory_lock($1, (j).id) AS locked
            FROM (
                SELECT j
                FROM rihanna_jobs AS j
                WHERE j.failed_at IS NULL
                  AND (j.due_at IS NULL OR j.due_at <= now())
                  AND NOT (j.id = ANY($3))
                ORDER BY j.priority ASC,
                         COALESCE(j.due_at, '-infinity'::timestamptz) ASC,
                         j.enqueued_at ASC,
                         j.id ASC
                LIMIT 1
                FOR UPDATE OF j SKIP LOCKED
            ) AS seed
        )
        UNION ALL
        (
            SELECT (j).*, pg_try_advisory_lock($1, (j).id) AS locked
            FROM (
                SELECT (
                    SELECT j
                    FROM rihanna_jobs AS j
                    WHERE j.failed_at IS NULL
                      AND (j.due_at IS NULL OR j.due_at <= now())
                      AND NOT (j.id = ANY($3))
                      AND (j.priority, COALESCE(j.due_at, '-infinity'::timestamptz), j.enqueued_at, j.id)
                          > (candidates.priority, COALESCE(candidates.due_at, '-infinity'::timestamptz), candidates.enqueued_at, candidates.id)
                    ORDER BY j.priority ASC,
                             COALESCE(j.due_at, '-infinity'::timestamptz) ASC,
                             j.enqueued_at ASC,
                             j.id ASC
                    LIMIT 1
                    FOR UPDATE OF j SKIP LOCKED
                ) AS j
                FROM candidates
                WHERE candidates.id IS NOT NULL
                LIMIT 1
            ) AS step
        )
    )
    SELECT id, payload, enqueued_at, due_at, failed_at, fail_reason,
           priority, rihanna_internal_meta
    FROM candidates
    WHERE locked
    LIMIT $2
";

/// Claim up to `n` runnable jobs for the calling session.
///
/// Returns claimed jobs in claim order: priority first (lower numbers win),
/// then due time with unscheduled jobs outranking scheduled ones, then
/// enqueue time. For every returned job the session behind `conn` holds the
/// `(class_id, id)` advisory lock until a `mark_*` transition resolves the
/// job or the session ends.
///
/// Jobs that have failed, are not yet due, are row-locked by another
/// transaction, or are advisory-locked by another session are skipped without
/// blocking. Ids in `exclude_ids` are never returned, so a caller can re-poll
/// while still working on earlier claims. Fewer than `n` results simply means
/// fewer claimable jobs existed.
pub async fn lock(
    conn: &mut PgConnection,
    class_id: i32,
    n: i64,
    exclude_ids: &[i32],
) -> Result<Vec<Job>, sqlx::Error> {
    if n <= 0 {
        return Ok(Vec::new());
    }

    sqlx::query_as::<_, Job>(LOCK_JOBS)
        .bind(class_id)
        .bind(n)
        .bind(exclude_ids)
        .fetch_all(conn)
        .await
}

/// Delete a job that has successfully completed, then release its advisory lock.
///
/// Returns the number of rows deleted. `0` means the row was already gone,
/// which callers treat as success. After this returns, the calling session no
/// longer holds the `(class_id, id)` advisory lock.
pub async fn mark_successful(
    conn: &mut PgConnection,
    class_id: i32,
    job: &Job,
) -> Result<u64, sqlx::Error> {
    let rows_affected = sqlx::query("DELETE FROM rihanna_jobs WHERE id = $1")
        .bind(job.id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

    release_lock(conn, class_id, job.id).await?;
    Ok(rows_affected)
}

/// Record a terminal failure, then release the advisory lock.
///
/// The job stays in the table with `failed_at` and `fail_reason` set; it will
/// never be claimed again unless an operator revives it with
/// [`retry_failed`].
pub async fn mark_failed(
    conn: &mut PgConnection,
    class_id: i32,
    job: &Job,
    failed_at: DateTime<Utc>,
    fail_reason: &str,
) -> Result<u64, sqlx::Error> {
    let rows_affected =
        sqlx::query("UPDATE rihanna_jobs SET failed_at = $2, fail_reason = $3 WHERE id = $1")
            .bind(job.id)
            .bind(failed_at)
            .bind(fail_reason)
            .execute(&mut *conn)
            .await?
            .rows_affected();

    release_lock(conn, class_id, job.id).await?;
    Ok(rows_affected)
}

/// Schedule another attempt at `due_at`, then release the advisory lock.
///
/// Increments the attempt counter; a missing counter counts as zero.
pub async fn mark_retried(
    conn: &mut PgConnection,
    class_id: i32,
    job: &Job,
    due_at: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let rows_affected = sqlx::query(
        r"
        UPDATE rihanna_jobs
        SET due_at = $2,
            rihanna_internal_meta = jsonb_set(
                rihanna_internal_meta,
                '{attempts}',
                to_jsonb(COALESCE((rihanna_internal_meta ->> 'attempts')::bigint, 0) + 1)
            )
        WHERE id = $1
        ",
    )
    .bind(job.id)
    .bind(due_at)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    release_lock(conn, class_id, job.id).await?;
    Ok(rows_affected)
}

/// Put the job back in the queue for `due_at`, then release the advisory lock.
///
/// Clears any failure fields and leaves the attempt counter untouched.
pub async fn mark_reenqueued(
    conn: &mut PgConnection,
    class_id: i32,
    job: &Job,
    due_at: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let rows_affected = sqlx::query(
        "UPDATE rihanna_jobs SET due_at = $2, failed_at = NULL, fail_reason = NULL WHERE id = $1",
    )
    .bind(job.id)
    .bind(due_at)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    release_lock(conn, class_id, job.id).await?;
    Ok(rows_affected)
}

/// Revert a failed job to the ready state.
///
/// Clears the failure fields and resets `enqueued_at`, so the job queues
/// behind everything enqueued since it originally entered. Returns
/// [`RetryFailedError::JobNotFound`] when the row is absent or not failed; in
/// that case the row is untouched.
pub async fn retry_failed<'e>(
    executor: impl PgExecutor<'e>,
    job_id: i32,
) -> Result<(), RetryFailedError> {
    let rows_affected = sqlx::query(
        r"
        UPDATE rihanna_jobs
        SET failed_at = NULL, fail_reason = NULL, enqueued_at = now()
        WHERE id = $1 AND failed_at IS NOT NULL
        ",
    )
    .bind(job_id)
    .execute(executor)
    .await?
    .rows_affected();

    if rows_affected == 0 {
        return Err(RetryFailedError::JobNotFound);
    }

    Ok(())
}

/// Release the session-scoped advisory lock taken by [`lock`].
async fn release_lock(conn: &mut PgConnection, class_id: i32, job_id: i32) -> Result<(), sqlx::Error> {
    let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1, $2)")
        .bind(class_id)
        .bind(job_id)
        .fetch_one(conn)
        .await?;

    if !released {
        warn!(job.id = job_id, "Session did not hold the advisory lock it tried to release");
    }

    Ok(())
}
