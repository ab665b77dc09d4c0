//! Append-only record of job execution attempts.
//!
//! Every attempt writes a `started` entry when it begins and exactly one
//! `succeeded` or `failed` entry when it completes. Entries are never updated
//! or deleted, so the log is the authoritative audit trail; the job row's
//! status column is a cached projection of it (see [`derive_status`]).

use crate::schema::{ExecutionLogEntry, ExecutionStatus, JobStatus};
use crate::storage;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};

const ENTRY_COLUMNS: &str =
    "id, job_id, attempt_number, status, started_at, finished_at, error_message, result, retryable";

/// Records that an attempt has begun.
///
/// Written on its own connection, outside the lease transaction, so the
/// entry survives even if the worker dies before the attempt completes.
pub(crate) async fn record_started(
    pool: &PgPool,
    job_id: i64,
    attempt_number: i32,
    started_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO job_executions (job_id, attempt_number, status, started_at)
        VALUES ($1, $2, 'started', $3)
        ",
    )
    .bind(job_id)
    .bind(attempt_number)
    .bind(started_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Records a successful attempt.
pub(crate) async fn record_succeeded(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
    attempt_number: i32,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    result: Option<Value>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO job_executions (job_id, attempt_number, status, started_at, finished_at, result)
        VALUES ($1, $2, 'succeeded', $3, $4, $5)
        ",
    )
    .bind(job_id)
    .bind(attempt_number)
    .bind(started_at)
    .bind(finished_at)
    .bind(result)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Records a failed attempt and whether the failure was retry-eligible.
pub(crate) async fn record_failed(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
    attempt_number: i32,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    error_message: &str,
    retryable: bool,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO job_executions
            (job_id, attempt_number, status, started_at, finished_at, error_message, retryable)
        VALUES ($1, $2, 'failed', $3, $4, $5, $6)
        ",
    )
    .bind(job_id)
    .bind(attempt_number)
    .bind(started_at)
    .bind(finished_at)
    .bind(error_message)
    .bind(retryable)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Stream a job's log entries in attempt order.
///
/// Lazy and restartable: dropping the stream and calling again re-reads from
/// the start.
pub fn entries_for(
    pool: &PgPool,
    job_id: i64,
) -> BoxStream<'_, Result<ExecutionLogEntry, sqlx::Error>> {
    sqlx::query_as::<_, ExecutionLogEntry>(
        "SELECT id, job_id, attempt_number, status, started_at, finished_at, error_message, \
         result, retryable FROM job_executions WHERE job_id = $1 \
         ORDER BY attempt_number ASC, id ASC",
    )
    .bind(job_id)
    .fetch(pool)
}

/// Fetch a job's log entries in attempt order.
pub async fn list_entries(
    pool: &PgPool,
    job_id: i64,
) -> Result<Vec<ExecutionLogEntry>, sqlx::Error> {
    sqlx::query_as::<_, ExecutionLogEntry>(&format!(
        "SELECT {ENTRY_COLUMNS} FROM job_executions WHERE job_id = $1 \
         ORDER BY attempt_number ASC, id ASC",
    ))
    .bind(job_id)
    .fetch_all(pool)
    .await
}

/// Recompute a job's current status from its log alone.
///
/// Used for recovery and audits; outside the window where an attempt's
/// transition is in flight this agrees with the job row's cached status.
/// Returns `None` for unknown job ids.
pub async fn latest_status(pool: &PgPool, job_id: i64) -> Result<Option<JobStatus>, sqlx::Error> {
    let Some(job) = storage::get_job(pool, job_id).await? else {
        return Ok(None);
    };
    let entries = list_entries(pool, job_id).await?;
    Ok(Some(derive_status(&entries, job.max_attempts)))
}

/// Project a status from ordered log entries and the job's attempt budget.
///
/// The last completion entry decides: a success is terminal, a permanent
/// failure is terminal, and a transient failure is either `Abandoned` (budget
/// exhausted) or `Retrying`. A trailing `started` entry means an attempt is
/// in flight right now.
pub fn derive_status(entries: &[ExecutionLogEntry], max_attempts: i32) -> JobStatus {
    let last_completed = entries
        .iter()
        .filter(|entry| entry.status != ExecutionStatus::Started)
        .next_back();

    let Some(completed) = last_completed else {
        if entries.is_empty() {
            return JobStatus::Pending;
        }
        return JobStatus::Processing;
    };

    match completed.status {
        ExecutionStatus::Succeeded => JobStatus::Succeeded,
        _ => {
            if completed.retryable == Some(false) {
                return JobStatus::Failed;
            }
            if completed.attempt_number >= max_attempts {
                return JobStatus::Abandoned;
            }
            let retry_started = entries.iter().any(|entry| {
                entry.status == ExecutionStatus::Started
                    && entry.attempt_number > completed.attempt_number
            });
            if retry_started {
                JobStatus::Processing
            } else {
                JobStatus::Retrying
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(attempt_number: i32, status: ExecutionStatus, retryable: Option<bool>) -> ExecutionLogEntry {
        ExecutionLogEntry {
            id: 0,
            job_id: 1,
            attempt_number,
            status,
            started_at: Utc::now(),
            finished_at: None,
            error_message: None,
            result: None,
            retryable,
        }
    }

    #[test]
    fn empty_log_is_pending() {
        assert_eq!(derive_status(&[], 3), JobStatus::Pending);
    }

    #[test]
    fn dangling_started_entry_is_processing() {
        let entries = [entry(1, ExecutionStatus::Started, None)];
        assert_eq!(derive_status(&entries, 3), JobStatus::Processing);
    }

    #[test]
    fn success_wins() {
        let entries = [
            entry(1, ExecutionStatus::Started, None),
            entry(1, ExecutionStatus::Failed, Some(true)),
            entry(2, ExecutionStatus::Started, None),
            entry(2, ExecutionStatus::Succeeded, None),
        ];
        assert_eq!(derive_status(&entries, 3), JobStatus::Succeeded);
    }

    #[test]
    fn transient_failure_below_budget_is_retrying() {
        let entries = [
            entry(1, ExecutionStatus::Started, None),
            entry(1, ExecutionStatus::Failed, Some(true)),
        ];
        assert_eq!(derive_status(&entries, 3), JobStatus::Retrying);
    }

    #[test]
    fn transient_failure_on_last_attempt_is_abandoned() {
        let entries = [
            entry(1, ExecutionStatus::Failed, Some(true)),
            entry(2, ExecutionStatus::Failed, Some(true)),
            entry(3, ExecutionStatus::Failed, Some(true)),
        ];
        assert_eq!(derive_status(&entries, 3), JobStatus::Abandoned);
    }

    #[test]
    fn permanent_failure_is_failed_regardless_of_budget() {
        let entries = [entry(1, ExecutionStatus::Failed, Some(false))];
        assert_eq!(derive_status(&entries, 3), JobStatus::Failed);
    }

    #[test]
    fn started_retry_after_failure_is_processing() {
        let entries = [
            entry(1, ExecutionStatus::Failed, Some(true)),
            entry(2, ExecutionStatus::Started, None),
        ];
        assert_eq!(derive_status(&entries, 3), JobStatus::Processing);
    }

    #[test]
    fn interrupted_attempt_redelivers_with_same_attempt_number() {
        // Worker died after the started entry; redelivery begins the same
        // attempt again and then completes it.
        let entries = [
            entry(1, ExecutionStatus::Started, None),
            entry(1, ExecutionStatus::Started, None),
            entry(1, ExecutionStatus::Succeeded, None),
        ];
        assert_eq!(derive_status(&entries, 3), JobStatus::Succeeded);
    }
}
