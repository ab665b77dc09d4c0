use crate::background_job::{BackgroundJob, JobMeta};
use crate::errors::ExecutionError;
use anyhow::anyhow;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

pub(crate) type RunTaskFn<Context> =
    fn(Context, Value, JobMeta) -> BoxFuture<'static, Result<Option<Value>, ExecutionError>>;

/// Per-job-type execution policy, captured from the trait's associated
/// consts at registration time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub(crate) max_attempts: i32,
    pub(crate) backoff_base: Duration,
    pub(crate) backoff_cap: Duration,
    pub(crate) execution_timeout: Duration,
}

pub(crate) struct RegisteredJob<Context> {
    pub(crate) run: RunTaskFn<Context>,
    pub(crate) policy: RetryPolicy,
}

impl<Context> Clone for RegisteredJob<Context> {
    fn clone(&self) -> Self {
        Self {
            run: self.run,
            policy: self.policy,
        }
    }
}

impl<Context> std::fmt::Debug for RegisteredJob<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredJob")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Mapping from job type name to its handler and policy.
///
/// Built once while configuring the [`crate::Runner`] and never mutated
/// afterwards; workers only read from it.
pub(crate) struct JobRegistry<Context> {
    jobs: HashMap<String, RegisteredJob<Context>>,
}

impl<Context> Default for JobRegistry<Context> {
    fn default() -> Self {
        Self {
            jobs: HashMap::new(),
        }
    }
}

impl<Context> Clone for JobRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            jobs: self.jobs.clone(),
        }
    }
}

impl<Context: Clone + Send + 'static> JobRegistry<Context> {
    pub(crate) fn register<J: BackgroundJob<Context = Context>>(&mut self) {
        let run: RunTaskFn<Context> = runnable::<J>;
        let policy = RetryPolicy {
            max_attempts: J::MAX_ATTEMPTS,
            backoff_base: J::BACKOFF_BASE,
            backoff_cap: J::BACKOFF_CAP,
            execution_timeout: J::EXECUTION_TIMEOUT,
        };

        self.jobs.insert(J::JOB_NAME.to_string(), RegisteredJob { run, policy });
    }

    pub(crate) fn get(&self, job_type: &str) -> Option<&RegisteredJob<Context>> {
        self.jobs.get(job_type)
    }

    /// The job type names this registry can dispatch; used to scope the
    /// queue query so foreign job types are left alone.
    pub(crate) fn job_types(&self) -> Vec<String> {
        self.jobs.keys().cloned().collect()
    }
}

fn runnable<J: BackgroundJob>(
    ctx: J::Context,
    payload: Value,
    meta: JobMeta,
) -> BoxFuture<'static, Result<Option<Value>, ExecutionError>> {
    Box::pin(async move {
        let job: J = serde_json::from_value(payload).map_err(|err| {
            ExecutionError::permanent(anyhow!("invalid payload for {}: {err}", J::JOB_NAME))
        })?;
        job.run(ctx, meta).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_none, assert_some};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct NoopJob;

    impl BackgroundJob for NoopJob {
        const JOB_NAME: &'static str = "noop";
        const MAX_ATTEMPTS: i32 = 7;
        type Context = ();

        async fn run(&self, _ctx: (), _meta: JobMeta) -> Result<Option<Value>, ExecutionError> {
            Ok(None)
        }
    }

    #[test]
    fn registered_jobs_are_found_with_their_policy() {
        let mut registry = JobRegistry::<()>::default();
        registry.register::<NoopJob>();

        let registered = assert_some!(registry.get("noop"));
        assert_eq!(registered.policy.max_attempts, 7);
        assert_eq!(registry.job_types(), vec!["noop".to_string()]);
    }

    #[test]
    fn unknown_job_types_are_not_found() {
        let registry = JobRegistry::<()>::default();
        assert_none!(registry.get("noop"));
    }

    #[tokio::test]
    async fn dispatch_rejects_malformed_payloads_permanently() {
        let mut registry = JobRegistry::<()>::default();
        registry.register::<NoopJob>();

        let registered = registry.get("noop").unwrap();
        let meta = JobMeta { job_id: 1, attempt: 1 };
        let result = (registered.run)((), Value::String("not a noop".into()), meta).await;

        match result {
            Err(err) => assert!(!err.is_retryable()),
            Ok(_) => panic!("malformed payload must not dispatch"),
        }
    }
}
