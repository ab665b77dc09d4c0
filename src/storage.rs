use crate::schema::{Job, JobStatus};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};

const JOB_COLUMNS: &str = "id, job_type, payload, status, attempts, max_attempts, not_before, \
                           created_at, updated_at, completed_at";

/// Inserts a new job in `pending` status with zero attempts.
pub(crate) async fn enqueue_job(
    pool: &PgPool,
    job_type: &str,
    payload: Value,
    max_attempts: i32,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "INSERT INTO background_jobs (job_type, payload, max_attempts) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(job_type)
    .bind(payload)
    .bind(max_attempts)
    .fetch_one(pool)
    .await
}

/// Finds the next job that is unlocked and eligible to run.
///
/// The returned row stays locked for the lifetime of `tx`; that transaction
/// is the job's lease. Jobs whose `not_before` is still in the future are
/// invisible to this query, which is how retry backoff is enforced.
pub(crate) async fn find_next_ready_job_tx(
    tx: &mut Transaction<'_, Postgres>,
    job_types: &[String],
) -> Result<Job, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        r"
        SELECT {JOB_COLUMNS}
        FROM background_jobs
        WHERE job_type = ANY($1)
          AND status IN ('pending', 'retrying')
          AND not_before <= NOW()
        ORDER BY id ASC
        FOR UPDATE SKIP LOCKED
        LIMIT 1
        ",
    ))
    .bind(job_types)
    .fetch_one(&mut **tx)
    .await
}

/// Marks the claimed job as running.
pub(crate) async fn mark_processing(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE background_jobs SET status = 'processing', updated_at = NOW() WHERE id = $1")
        .bind(job_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Moves a job to a terminal status.
///
/// The update is a compare-and-set keyed on the attempt count the worker
/// observed when it claimed the job; returns whether the row was transitioned.
pub(crate) async fn finalize_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
    status: JobStatus,
    new_attempts: i32,
    observed_attempts: i32,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE background_jobs
        SET status = $2, attempts = $3, completed_at = NOW(), updated_at = NOW()
        WHERE id = $1 AND attempts = $4
        ",
    )
    .bind(job_id)
    .bind(status)
    .bind(new_attempts)
    .bind(observed_attempts)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Schedules another attempt for a transiently failed job.
///
/// Same compare-and-set rule as [`finalize_job`]; `delay_ms` is the backoff
/// (jitter included) before the job becomes visible to workers again,
/// measured from wall-clock time rather than the lease transaction's start.
pub(crate) async fn schedule_retry(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
    new_attempts: i32,
    observed_attempts: i32,
    delay_ms: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE background_jobs
        SET status = 'retrying',
            attempts = $2,
            not_before = CLOCK_TIMESTAMP() + ($3 * INTERVAL '1 millisecond'),
            updated_at = NOW()
        WHERE id = $1 AND attempts = $4
        ",
    )
    .bind(job_id)
    .bind(new_attempts)
    .bind(delay_ms)
    .bind(observed_attempts)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Fetch a single job by id.
pub async fn get_job(pool: &PgPool, job_id: i64) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>(&format!(
        "SELECT {JOB_COLUMNS} FROM background_jobs WHERE id = $1",
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await
}

/// Filter for [`list_jobs`].
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    /// Only jobs of this type.
    pub job_type: Option<String>,
    /// Only jobs in this status.
    pub status: Option<JobStatus>,
    /// Maximum number of rows, newest first.
    pub limit: Option<i64>,
}

/// List jobs, newest first, optionally filtered by type and status.
pub async fn list_jobs(pool: &PgPool, query: &JobQuery) -> Result<Vec<Job>, sqlx::Error> {
    let mut sql = format!("SELECT {JOB_COLUMNS} FROM background_jobs");

    let mut conditions = Vec::new();
    let mut next_placeholder = 1;
    if query.job_type.is_some() {
        conditions.push(format!("job_type = ${next_placeholder}"));
        next_placeholder += 1;
    }
    if query.status.is_some() {
        conditions.push(format!("status = ${next_placeholder}"));
        next_placeholder += 1;
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    sql.push_str(" ORDER BY created_at DESC, id DESC");

    if query.limit.is_some() {
        sql.push_str(&format!(" LIMIT ${next_placeholder}"));
    }

    let mut query_builder = sqlx::query_as::<_, Job>(&sql);
    if let Some(job_type) = &query.job_type {
        query_builder = query_builder.bind(job_type);
    }
    if let Some(status) = query.status {
        query_builder = query_builder.bind(status);
    }
    if let Some(limit) = query.limit {
        query_builder = query_builder.bind(limit);
    }

    query_builder.fetch_all(pool).await
}

/// The number of waiting jobs older than `staleness_secs`, a backlog signal.
pub(crate) async fn stale_backlog_count(
    pool: &PgPool,
    staleness_secs: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r"
        SELECT COUNT(*)
        FROM background_jobs
        WHERE status IN ('pending', 'retrying')
          AND created_at < NOW() - ($1 * INTERVAL '1 second')
        ",
    )
    .bind(staleness_secs)
    .fetch_one(pool)
    .await
}

/// Succeeded and failed execution counts over the last 24 hours.
pub(crate) async fn recent_execution_counts(pool: &PgPool) -> Result<(i64, i64), sqlx::Error> {
    sqlx::query_as::<_, (i64, i64)>(
        r"
        SELECT COUNT(*) FILTER (WHERE status = 'succeeded'),
               COUNT(*) FILTER (WHERE status = 'failed')
        FROM job_executions
        WHERE started_at > NOW() - INTERVAL '24 hours'
        ",
    )
    .fetch_one(pool)
    .await
}
