use crate::errors::{EnqueueError, ExecutionError};
use crate::storage;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::PgPool;
use std::future::Future;
use std::time::Duration;
use tracing::instrument;

/// Identity of the running attempt, passed to every handler invocation.
///
/// Delivery is at-least-once, so handlers must be idempotent; `job_id` and
/// `attempt` are exposed so idempotency keys can be derived from them.
#[derive(Debug, Clone, Copy)]
pub struct JobMeta {
    /// The job being executed.
    pub job_id: i64,
    /// The attempt currently running, counted from 1.
    pub attempt: i32,
}

/// Trait for defining background jobs that can be enqueued and executed
/// asynchronously.
pub trait BackgroundJob: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the task.
    ///
    /// This MUST be unique for the whole application.
    const JOB_NAME: &'static str;

    /// Attempt budget for this job type, including the first execution.
    ///
    /// Once this many attempts have failed transiently the job is abandoned.
    const MAX_ATTEMPTS: i32 = 3;

    /// Base delay before the first retry; doubles with every further attempt.
    const BACKOFF_BASE: Duration = Duration::from_secs(2);

    /// Upper bound on the retry delay, before jitter.
    const BACKOFF_CAP: Duration = Duration::from_secs(300);

    /// How long a single attempt may run before it is treated as a transient
    /// failure and rescheduled.
    const EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);

    /// The application data provided to this job at runtime.
    type Context: Clone + Send + 'static;

    /// Execute the task. This method should define its logic.
    ///
    /// Returning `Ok` may carry an opaque result value that is recorded in
    /// the execution log. Failures must be classified: transient errors are
    /// retried with backoff, permanent errors end the job immediately.
    fn run(
        &self,
        ctx: Self::Context,
        meta: JobMeta,
    ) -> impl Future<Output = Result<Option<Value>, ExecutionError>> + Send;

    /// Enqueue this job for background execution.
    ///
    /// Returns the job ID, or `QueueUnavailable` if the queue cannot accept
    /// the job.
    #[instrument(name = "workhorse.enqueue", skip(self, pool), fields(message = Self::JOB_NAME))]
    fn enqueue<'a>(&'a self, pool: &'a PgPool) -> BoxFuture<'a, Result<i64, EnqueueError>> {
        let payload = match serde_json::to_value(self) {
            Ok(payload) => payload,
            Err(err) => return async move { Err(EnqueueError::Serialization(err)) }.boxed(),
        };

        async move {
            let id = storage::enqueue_job(pool, Self::JOB_NAME, payload, Self::MAX_ATTEMPTS).await?;
            Ok(id)
        }
        .boxed()
    }
}
