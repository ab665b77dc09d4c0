use crate::BackgroundJob;
use crate::job_registry::JobRegistry;
use crate::worker::Worker;
use futures_util::future::join_all;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// The core runner responsible for locking and running jobs.
///
/// Configured once at process start: worker count, polling cadence, and the
/// immutable job-type registry. [`Runner::start`] spawns the worker pool.
pub struct Runner<Context: Clone + Send + Sync + 'static> {
    connection_pool: PgPool,
    job_registry: JobRegistry<Context>,
    context: Context,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    shutdown_when_queue_empty: bool,
}

impl<Context: std::fmt::Debug + Clone + Sync + Send> std::fmt::Debug for Runner<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("job_types", &self.job_registry.job_types())
            .field("context", &self.context)
            .field("num_workers", &self.num_workers)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> Runner<Context> {
    /// Create a new runner with the given connection pool and context.
    pub fn new(connection_pool: PgPool, context: Context) -> Self {
        Self {
            connection_pool,
            job_registry: JobRegistry::default(),
            context,
            num_workers: 1,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            shutdown_when_queue_empty: false,
        }
    }

    /// Set the number of parallel workers.
    ///
    /// Keep this below the pool's connection limit: a running job holds its
    /// lease connection and briefly uses a second one for the log's start
    /// marker.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how often idle workers poll for new jobs.
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

    /// Configure a job type to be executed by this runner.
    pub fn register_job_type<J: BackgroundJob<Context = Context>>(mut self) -> Self {
        self.job_registry.register::<J>();
        self
    }

    /// Set the runner to shut down when the background job queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Start the background workers.
    ///
    /// This returns a [`RunHandle`] which can be used to wait for the workers
    /// to shut down, or to stop them gracefully.
    pub fn start(&self) -> RunHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = Arc::new(self.job_registry.clone());

        let mut handles = Vec::with_capacity(self.num_workers);
        for i in 1..=self.num_workers {
            let name = format!("background-worker-{i}");
            info!(worker.name = %name, "Starting worker…");

            let worker = Worker {
                connection_pool: self.connection_pool.clone(),
                context: self.context.clone(),
                job_registry: registry.clone(),
                shutdown: shutdown_rx.clone(),
                shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                poll_interval: self.poll_interval,
                jitter: self.jitter,
            };

            let span = info_span!("worker", worker.name = %name);
            let handle = tokio::spawn(async move { worker.run().instrument(span).await });

            handles.push(handle);
        }

        RunHandle {
            handles,
            shutdown: shutdown_tx,
        }
    }
}

/// Handle to a running background job processing system.
#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
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

    /// Stop the worker pool gracefully.
    ///
    /// Workers stop pulling new jobs immediately; handlers already in flight
    /// get up to `grace` to finish. Anything still running after that is
    /// aborted; its lease transaction rolls back, so the job becomes
    /// visible to workers again on the next delivery.
    pub async fn shutdown(mut self, grace: Duration) {
        if self.shutdown.send(true).is_err() {
            // All workers already exited on their own.
            return;
        }

        let drain = join_all(self.handles.iter_mut());
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("Grace period elapsed. Aborting in-flight workers…");
            for handle in &self.handles {
                handle.abort();
            }
        }
    }
}
