use thiserror::Error;

/// Error type for job enqueueing operations.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The job argument could not be serialized to JSON.
    #[error(transparent)]
    SerializationError(#[from] serde_json::Error),

    /// The insert itself failed.
    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),
}

/// Error type for [`retry_failed`](crate::storage::retry_failed).
#[derive(Debug, Error)]
pub enum RetryFailedError {
    /// The job does not exist, or it is not in a failed state.
    #[error("job not found or not in a failed state")]
    JobNotFound,

    /// The update itself failed.
    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),
}
