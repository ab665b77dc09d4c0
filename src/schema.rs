//! Database schema definitions for SQLx.
//!
//! This module contains the database types and structures for the background
//! job system and its execution log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Lifecycle state of a job.
///
/// This column is a cached projection of the job's execution log; the log is
/// authoritative and the current state can always be recomputed from it via
/// [`crate::derive_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Enqueued, waiting for a worker.
    Pending,
    /// Claimed by a worker and currently executing.
    Processing,
    /// Terminal: the handler returned successfully.
    Succeeded,
    /// Terminal: the handler failed with a permanent (non-retryable) error.
    Failed,
    /// Failed transiently; scheduled for another attempt after `not_before`.
    Retrying,
    /// Terminal: the attempt budget is exhausted and the last attempt failed.
    Abandoned,
}

impl JobStatus {
    /// Whether this status is terminal (no further attempts will run).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Abandoned)
    }
}

/// Represents a background job record in the database.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier for the job, assigned at enqueue time.
    pub id: i64,
    /// Type identifier for the job (used for dispatch).
    pub job_type: String,
    /// JSON data containing the job payload.
    pub payload: Value,
    /// Cached lifecycle state.
    pub status: JobStatus,
    /// Number of execution attempts made so far.
    pub attempts: i32,
    /// Attempt budget for this job, copied from its type's policy at enqueue.
    pub max_attempts: i32,
    /// Earliest time the job is eligible for (re)execution.
    pub not_before: DateTime<Utc>,
    /// Timestamp when the job was created.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last state change.
    pub updated_at: DateTime<Utc>,
    /// Timestamp of the terminal transition, if any.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Outcome classification of a single execution log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "execution_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The attempt began; a completion entry follows unless the worker died.
    Started,
    /// The attempt completed successfully.
    Succeeded,
    /// The attempt failed.
    Failed,
}

/// One record in the append-only execution log.
///
/// Entries for a job are ordered by `attempt_number` (with insertion order as
/// tiebreaker) and are never updated or deleted.
#[derive(Debug, Clone, FromRow)]
pub struct ExecutionLogEntry {
    /// Insertion-ordered identifier.
    pub id: i64,
    /// The job this entry documents (many entries per job).
    pub job_id: i64,
    /// The attempt this entry documents, counted from 1.
    pub attempt_number: i32,
    /// What this entry records.
    pub status: ExecutionStatus,
    /// When the attempt began.
    pub started_at: DateTime<Utc>,
    /// When the attempt finished; absent on `started` entries.
    pub finished_at: Option<DateTime<Utc>>,
    /// Handler error, present iff `status` is `failed`.
    pub error_message: Option<String>,
    /// Opaque handler result, present iff `status` is `succeeded`.
    pub result: Option<Value>,
    /// On failed entries, whether the failure was classified as transient.
    pub retryable: Option<bool>,
}
