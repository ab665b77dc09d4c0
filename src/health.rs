//! Dependency probing and health aggregation.
//!
//! Probes are polymorphic over "round-trip the dependency once and report";
//! the aggregator bounds every probe with a timeout and converts failures
//! into structured results, so a hung dependency can never hang a health
//! endpoint and probe errors never escape as faults.

use crate::storage;
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, join_all};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_STALENESS: Duration = Duration::from_secs(60);
const DEFAULT_MAX_BACKLOG: i64 = 100;

/// A connectivity check against one dependency.
///
/// Implementations report success (optionally with a diagnostic detail) or
/// fail with an error; latency measurement and timeout enforcement are the
/// aggregator's job.
pub trait HealthProbe: Send + Sync {
    /// Component name as reported in health responses.
    fn component(&self) -> &'static str;

    /// Round-trip the dependency once.
    fn check(&self) -> BoxFuture<'_, anyhow::Result<Option<String>>>;
}

/// Outcome of probing a single component.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    /// Which dependency was probed.
    #[serde(skip)]
    pub component: &'static str,
    /// Whether the probe round-tripped within its timeout.
    pub healthy: bool,
    /// Measured probe round-trip duration.
    pub latency_ms: u64,
    /// When the probe ran.
    pub checked_at: DateTime<Utc>,
    /// Diagnostic detail; always present on unhealthy results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Aggregated outcome of a set of probes.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Whether every probed component was healthy.
    pub healthy: bool,
    /// Per-component results, in registration order.
    pub results: Vec<HealthCheckResult>,
}

/// Composes probe results into liveness/readiness verdicts.
///
/// Critical probes gate readiness; diagnostic probes are additionally
/// included in the comprehensive report but never block traffic routing.
pub struct HealthAggregator {
    critical: Vec<Arc<dyn HealthProbe>>,
    diagnostic: Vec<Arc<dyn HealthProbe>>,
    probe_timeout: Duration,
}

impl std::fmt::Debug for HealthAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthAggregator")
            .field(
                "critical",
                &self.critical.iter().map(|p| p.component()).collect::<Vec<_>>(),
            )
            .field(
                "diagnostic",
                &self.diagnostic.iter().map(|p| p.component()).collect::<Vec<_>>(),
            )
            .field("probe_timeout", &self.probe_timeout)
            .finish()
    }
}

impl Default for HealthAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthAggregator {
    /// Create an aggregator with no probes and the default 2s probe timeout.
    pub fn new() -> Self {
        Self {
            critical: Vec::new(),
            diagnostic: Vec::new(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// The standard probe set for a pool-backed deployment: data store and
    /// broker gate readiness, queue depth and execution activity are
    /// diagnostic.
    pub fn with_default_probes(pool: PgPool) -> Self {
        Self::new()
            .critical(DataStoreProbe::new(pool.clone()))
            .critical(BrokerProbe::new(pool.clone()))
            .diagnostic(QueueDepthProbe::new(pool.clone()))
            .diagnostic(ActivityProbe::new(pool))
    }

    /// Set the per-probe timeout.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Add a probe that gates readiness.
    pub fn critical(mut self, probe: impl HealthProbe + 'static) -> Self {
        self.critical.push(Arc::new(probe));
        self
    }

    /// Add a probe that only appears in the comprehensive report.
    pub fn diagnostic(mut self, probe: impl HealthProbe + 'static) -> Self {
        self.diagnostic.push(Arc::new(probe));
        self
    }

    /// Probe the critical dependencies.
    ///
    /// Probes run concurrently, each bounded by the probe timeout, so the
    /// slowest dependency bounds the whole report.
    pub async fn readiness(&self) -> HealthReport {
        self.run_probes(&self.critical).await
    }

    /// Probe everything, critical and diagnostic.
    pub async fn diagnostics(&self) -> HealthReport {
        let probes: Vec<_> = self.critical.iter().chain(&self.diagnostic).collect();
        let results = join_all(probes.into_iter().map(|probe| self.check_one(probe.as_ref()))).await;
        HealthReport {
            healthy: results.iter().all(|result| result.healthy),
            results,
        }
    }

    async fn run_probes(&self, probes: &[Arc<dyn HealthProbe>]) -> HealthReport {
        let results = join_all(probes.iter().map(|probe| self.check_one(probe.as_ref()))).await;
        HealthReport {
            healthy: results.iter().all(|result| result.healthy),
            results,
        }
    }

    async fn check_one(&self, probe: &dyn HealthProbe) -> HealthCheckResult {
        let started = Instant::now();
        let outcome = tokio::time::timeout(self.probe_timeout, probe.check()).await;
        let latency = started.elapsed();
        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        let checked_at = Utc::now();

        let (healthy, detail) = match outcome {
            Ok(Ok(detail)) => (true, detail),
            Ok(Err(error)) => (false, Some(error.to_string())),
            Err(_) => (false, Some("timeout".to_string())),
        };

        HealthCheckResult {
            component: probe.component(),
            healthy,
            latency_ms,
            checked_at,
            detail,
        }
    }
}

/// Round-trip query against the record store.
pub struct DataStoreProbe {
    pool: PgPool,
}

impl DataStoreProbe {
    /// Probe the given pool's database.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl HealthProbe for DataStoreProbe {
    fn component(&self) -> &'static str {
        "datastore"
    }

    fn check(&self) -> BoxFuture<'_, anyhow::Result<Option<String>>> {
        Box::pin(async move {
            sqlx::query_scalar::<_, i32>("SELECT 1")
                .fetch_one(&self.pool)
                .await?;
            Ok(None)
        })
    }
}

/// Round-trip against the job queue itself, verifying it can be read.
pub struct BrokerProbe {
    pool: PgPool,
}

impl BrokerProbe {
    /// Probe the given pool's job queue.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl HealthProbe for BrokerProbe {
    fn component(&self) -> &'static str {
        "broker"
    }

    fn check(&self) -> BoxFuture<'_, anyhow::Result<Option<String>>> {
        Box::pin(async move {
            let in_flight = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM background_jobs WHERE status = 'processing'",
            )
            .fetch_one(&self.pool)
            .await?;
            Ok(Some(format!("{in_flight} jobs in flight")))
        })
    }
}

/// Backlog signal: waiting jobs that have sat in the queue for longer than a
/// staleness threshold.
pub struct QueueDepthProbe {
    pool: PgPool,
    staleness: Duration,
    max_backlog: i64,
}

impl QueueDepthProbe {
    /// Probe the given pool's queue backlog with default thresholds.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            staleness: DEFAULT_STALENESS,
            max_backlog: DEFAULT_MAX_BACKLOG,
        }
    }

    /// Age a waiting job must exceed before it counts as backlog.
    pub fn staleness(mut self, staleness: Duration) -> Self {
        self.staleness = staleness;
        self
    }

    /// Stale-job count above which the probe reports unhealthy.
    pub fn max_backlog(mut self, max_backlog: i64) -> Self {
        self.max_backlog = max_backlog;
        self
    }
}

impl HealthProbe for QueueDepthProbe {
    fn component(&self) -> &'static str {
        "queue"
    }

    fn check(&self) -> BoxFuture<'_, anyhow::Result<Option<String>>> {
        Box::pin(async move {
            let staleness_secs = i64::try_from(self.staleness.as_secs()).unwrap_or(i64::MAX);
            let depth = storage::stale_backlog_count(&self.pool, staleness_secs).await?;
            if depth > self.max_backlog {
                anyhow::bail!("backlog of {depth} stale jobs exceeds {}", self.max_backlog);
            }
            Ok(Some(format!("{depth} stale jobs waiting")))
        })
    }
}

/// Recent execution throughput, for the comprehensive report.
pub struct ActivityProbe {
    pool: PgPool,
}

impl ActivityProbe {
    /// Report on the given pool's execution log.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl HealthProbe for ActivityProbe {
    fn component(&self) -> &'static str {
        "activity"
    }

    fn check(&self) -> BoxFuture<'_, anyhow::Result<Option<String>>> {
        Box::pin(async move {
            let (succeeded, failed) = storage::recent_execution_counts(&self.pool).await?;
            Ok(Some(format!(
                "{succeeded} succeeded / {failed} failed in the last 24h"
            )))
        })
    }
}
