//! Timer-driven generation of well-known job types at fixed intervals.

use crate::BackgroundJob;
use crate::storage;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

const DEFAULT_TICK: Duration = Duration::from_secs(5);

type PayloadFn = Box<dyn Fn() -> Result<Value, serde_json::Error> + Send + Sync>;

/// Periodic job schedule, configured once at startup.
///
/// The schedule wakes at a fixed tick and enqueues every registered entry
/// whose interval has elapsed since it last fired, through the same path as
/// ad-hoc enqueues. Ticks missed while the process was down are not
/// backfilled; after a restart each entry fires once on the first tick.
///
/// Run at most one schedule instance per deployment: a second instance
/// would double-fire every entry. Scaling out requires an external lock or
/// idempotent periodic job types.
pub struct PeriodicSchedule {
    entries: Vec<ScheduleEntry>,
    tick: Duration,
}

struct ScheduleEntry {
    job_type: &'static str,
    interval: Duration,
    max_attempts: i32,
    payload: PayloadFn,
    last_fired_at: Option<DateTime<Utc>>,
}

impl ScheduleEntry {
    fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_fired_at {
            None => true,
            Some(last) => now
                .signed_duration_since(last)
                .to_std()
                .is_ok_and(|elapsed| elapsed >= self.interval),
        }
    }

    fn mark_fired(&mut self, now: DateTime<Utc>) {
        self.last_fired_at = Some(now);
    }
}

impl std::fmt::Debug for PeriodicSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicSchedule")
            .field(
                "entries",
                &self.entries.iter().map(|e| e.job_type).collect::<Vec<_>>(),
            )
            .field("tick", &self.tick)
            .finish()
    }
}

impl Default for PeriodicSchedule {
    fn default() -> Self {
        Self::new()
    }
}

impl PeriodicSchedule {
    /// Create an empty schedule with the default tick.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            tick: DEFAULT_TICK,
        }
    }

    /// Set how often the schedule checks for due entries.
    pub fn tick_interval(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Enqueue `job` every `interval`.
    ///
    /// The job value is serialized freshly at every firing.
    pub fn every<J: BackgroundJob>(mut self, interval: Duration, job: J) -> Self {
        self.entries.push(ScheduleEntry {
            job_type: J::JOB_NAME,
            interval,
            max_attempts: J::MAX_ATTEMPTS,
            payload: Box::new(move || serde_json::to_value(&job)),
            last_fired_at: None,
        });
        self
    }

    /// Spawn the schedule loop onto the runtime.
    pub fn start(self, pool: PgPool) -> AbortHandle {
        let task = tokio::spawn(async move { self.run(pool).await });
        task.abort_handle()
    }

    /// Run the schedule loop forever.
    pub async fn run(mut self, pool: PgPool) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            self.fire_due(&pool, Utc::now()).await;
        }
    }

    async fn fire_due(&mut self, pool: &PgPool, now: DateTime<Utc>) {
        for entry in &mut self.entries {
            if !entry.is_due(now) {
                continue;
            }

            let payload = match (entry.payload)() {
                Ok(payload) => payload,
                Err(error) => {
                    error!(%error, job.type = %entry.job_type, "Failed to serialize periodic job payload");
                    continue;
                }
            };

            match storage::enqueue_job(pool, entry.job_type, payload, entry.max_attempts).await {
                Ok(id) => {
                    debug!(job.id = %id, job.type = %entry.job_type, "Enqueued periodic job");
                    entry.mark_fired(now);
                }
                Err(error) => {
                    // last_fired_at stays untouched, so the entry is retried
                    // on the next tick.
                    warn!(%error, job.type = %entry.job_type, "Failed to enqueue periodic job");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn test_entry(interval: Duration) -> ScheduleEntry {
        ScheduleEntry {
            job_type: "heartbeat",
            interval,
            max_attempts: 1,
            payload: Box::new(|| Ok(Value::Null)),
            last_fired_at: None,
        }
    }

    #[test]
    fn entries_fire_immediately_after_startup() {
        let entry = test_entry(Duration::from_secs(3600));
        assert!(entry.is_due(Utc::now()));
    }

    #[test]
    fn entries_fire_at_most_once_per_interval() {
        let mut entry = test_entry(Duration::from_secs(60));
        let t0 = Utc::now();

        assert!(entry.is_due(t0));
        entry.mark_fired(t0);

        assert!(!entry.is_due(t0 + TimeDelta::seconds(1)));
        assert!(!entry.is_due(t0 + TimeDelta::seconds(59)));
        assert!(entry.is_due(t0 + TimeDelta::seconds(60)));
    }

    #[test]
    fn clock_going_backwards_does_not_fire() {
        let mut entry = test_entry(Duration::from_secs(60));
        let t0 = Utc::now();
        entry.mark_fired(t0);

        assert!(!entry.is_due(t0 - TimeDelta::seconds(120)));
    }
}
