/// Error type for job enqueueing operations.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// The job payload could not be serialized to JSON.
    #[error("failed to serialize job payload")]
    Serialization(#[from] serde_json::Error),

    /// The queue could not accept the job.
    #[error("job queue is unavailable")]
    QueueUnavailable(#[from] sqlx::Error),
}

/// Classified failure returned by a job handler.
///
/// The engine consumes the variant, not the inner error: [`Transient`]
/// failures are retried with backoff until the job's attempt budget runs out,
/// [`Permanent`] failures end the job immediately regardless of remaining
/// attempts.
///
/// [`Transient`]: ExecutionError::Transient
/// [`Permanent`]: ExecutionError::Permanent
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// Retry-eligible failure (network error, dependency timeout).
    #[error("transient failure: {0}")]
    Transient(anyhow::Error),

    /// Non-retryable failure (invalid payload, programmer error).
    #[error("permanent failure: {0}")]
    Permanent(anyhow::Error),
}

impl ExecutionError {
    /// Wrap an error as a transient, retry-eligible failure.
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        Self::Transient(error.into())
    }

    /// Wrap an error as a permanent, non-retryable failure.
    pub fn permanent(error: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(error.into())
    }

    /// Whether the engine may retry the attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
