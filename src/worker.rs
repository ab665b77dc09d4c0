use crate::background_job::JobMeta;
use crate::errors::ExecutionError;
use crate::execution_log;
use crate::job_registry::{JobRegistry, RetryPolicy};
use crate::schema::JobStatus;
use crate::storage;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use anyhow::anyhow;
use chrono::Utc;
use futures_util::FutureExt;
use rand::Rng;
use sentry_core::{Hub, SentryFutureExt};
use sqlx::PgPool;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info_span, trace, warn};

/// Policy applied when a job's type is no longer registered; only the
/// backoff fields are ever read, and only on paths that cannot be reached
/// for unregistered types.
const FALLBACK_POLICY: RetryPolicy = RetryPolicy {
    max_attempts: 3,
    backoff_base: Duration::from_secs(2),
    backoff_cap: Duration::from_secs(300),
    execution_timeout: Duration::from_secs(30),
};

pub(crate) struct Worker<Context> {
    pub(crate) connection_pool: PgPool,
    pub(crate) context: Context,
    pub(crate) job_registry: Arc<JobRegistry<Context>>,
    pub(crate) shutdown: watch::Receiver<bool>,
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

    /// Run background jobs until shutdown is requested, or until the queue is
    /// empty if `shutdown_when_queue_empty` is set.
    pub(crate) async fn run(&self) {
        let mut shutdown = self.shutdown.clone();

        loop {
            // A dropped sender counts as a shutdown request too, so orphaned
            // workers wind down instead of spinning.
            if shutdown.has_changed().is_err() || *shutdown.borrow() {
                debug!("Shutdown requested. Stopping the worker…");
                break;
            }

            match self.run_next_job().await {
                Ok(Some(_)) => {}
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("No pending background jobs found. Shutting down the worker…");
                    break;
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("No pending background jobs found. Polling again in {sleep_duration:?}…");
                    tokio::select! {
                        _ = sleep(sleep_duration) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(error) => {
                    // Infrastructure failure (e.g. the queue is unreachable);
                    // back off briefly before polling again, distinct from
                    // per-job retry backoff.
                    error!("Failed to run job: {error}");
                    tokio::select! {
                        _ = sleep(self.sleep_duration_with_jitter()) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    /// Run the next job in the queue, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was run
    /// - `Ok(None)` if no jobs were waiting
    /// - `Err(...)` if there was an error retrieving the job
    async fn run_next_job(&self) -> anyhow::Result<Option<i64>> {
        let context = self.context.clone();
        let job_registry = self.job_registry.clone();
        let pool = &self.connection_pool;

        let job_types = job_registry.job_types();

        trace!("Looking for the next background job…");

        // The transaction holds the row lock for the whole attempt; it is the
        // job's lease. If the worker dies, the transaction aborts and the job
        // becomes visible to the pool again.
        let mut tx = pool.begin().await?;

        let job = match storage::find_next_ready_job_tx(&mut tx, &job_types).await {
            Ok(job) => job,
            Err(sqlx::Error::RowNotFound) => {
                tx.rollback().await?;
                return Ok(None);
            }
            Err(e) => {
                tx.rollback().await?;
                return Err(e.into());
            }
        };

        let span = info_span!("job", job.id = %job.id, job.type = %job.job_type);

        let job_id = job.id;
        let attempt = job.attempts + 1;
        let meta = JobMeta { job_id, attempt };

        storage::mark_processing(&mut tx, job_id).await?;

        // Durable start marker, committed outside the lease so an attempt
        // that dies mid-flight still leaves a trace in the log.
        let started_at = Utc::now();
        execution_log::record_started(pool, job_id, attempt, started_at).await?;

        debug!("Running job…");

        let outcome = match job_registry.get(&job.job_type) {
            None => Err(ExecutionError::permanent(anyhow!(
                "unknown job type {}",
                job.job_type
            ))),
            Some(registered) => {
                let run = registered.run;
                let execution_timeout = registered.policy.execution_timeout;
                let payload = job.payload.clone();

                let future = with_sentry_transaction(&job.job_type, || async move {
                    AssertUnwindSafe(run(context, payload, meta))
                        .catch_unwind()
                        .await
                        .map_err(|panic| {
                            ExecutionError::transient(try_to_extract_panic_info(&*panic))
                        })
                        .and_then(std::convert::identity)
                });

                match tokio::time::timeout(execution_timeout, future)
                    .instrument(span.clone())
                    .bind_hub(Hub::current())
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ExecutionError::transient(anyhow!(
                        "execution timed out after {execution_timeout:?}"
                    ))),
                }
            }
        };
        let finished_at = Utc::now();

        let policy = job_registry
            .get(&job.job_type)
            .map(|registered| registered.policy)
            .unwrap_or(FALLBACK_POLICY);

        // The log write always lands before the status transition; both
        // commit atomically with the lease, so the log is never behind the
        // visible state.
        let transitioned: Result<bool, sqlx::Error> = async {
            match outcome {
                Ok(result) => {
                    debug!("Job succeeded");
                    execution_log::record_succeeded(
                        &mut tx, job_id, attempt, started_at, finished_at, result,
                    )
                    .await?;
                    storage::finalize_job(
                        &mut tx,
                        job_id,
                        JobStatus::Succeeded,
                        attempt,
                        job.attempts,
                    )
                    .await
                }
                Err(error) if error.is_retryable() => {
                    warn!("Failed to run job: {error}");
                    execution_log::record_failed(
                        &mut tx,
                        job_id,
                        attempt,
                        started_at,
                        finished_at,
                        &error.to_string(),
                        true,
                    )
                    .await?;

                    if attempt >= job.max_attempts {
                        debug!("Attempt budget exhausted. Abandoning job…");
                        storage::finalize_job(
                            &mut tx,
                            job_id,
                            JobStatus::Abandoned,
                            attempt,
                            job.attempts,
                        )
                        .await
                    } else {
                        let delay =
                            backoff_with_jitter(policy.backoff_base, policy.backoff_cap, attempt);
                        debug!("Scheduling retry in {delay:?}…");
                        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                        storage::schedule_retry(&mut tx, job_id, attempt, job.attempts, delay_ms)
                            .await
                    }
                }
                Err(error) => {
                    warn!("Failed to run job: {error}");
                    execution_log::record_failed(
                        &mut tx,
                        job_id,
                        attempt,
                        started_at,
                        finished_at,
                        &error.to_string(),
                        false,
                    )
                    .await?;
                    storage::finalize_job(&mut tx, job_id, JobStatus::Failed, attempt, job.attempts)
                        .await
                }
            }
        }
        .instrument(span.clone())
        .await;

        if !transitioned? {
            span.in_scope(|| warn!("Job was modified concurrently; leaving its status untouched"));
        }

        tx.commit().await?;

        Ok(Some(job_id))
    }
}

/// Exponential backoff for the given attempt, capped, without jitter.
pub(crate) fn backoff(base: Duration, cap: Duration, attempt: i32) -> Duration {
    let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(0).min(31);
    base.saturating_mul(2u32.saturating_pow(exponent)).min(cap)
}

/// [`backoff`] plus up to 25% of random jitter, to spread retry herds.
pub(crate) fn backoff_with_jitter(base: Duration, cap: Duration, attempt: i32) -> Duration {
    let delay = backoff(base, cap, attempt);
    let jitter_cap = u64::try_from(delay.as_millis() / 4).unwrap_or(u64::MAX);
    let jitter = rand::thread_rng().gen_range(0..=jitter_cap);
    delay + Duration::from_millis(jitter)
}
