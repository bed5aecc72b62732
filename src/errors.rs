use thiserror::Error;

/// Errors surfaced by the job store and its SQL layer.
#[derive(Error, Debug)]
pub enum ProcrastinateError {
    /// An error occurred while executing an SQL query
    #[error("Error occured while query: {0}")]
    SqlError(#[from] sqlx::Error),

    /// An error occurred while serializing or deserializing JSON data
    #[error("Error while serializing job args: {0}")]
    JsonSerializeError(#[from] serde_json::Error),

    /// A defer was rejected because a job holding the same queueing lock
    /// is still waiting or running. Never retried internally.
    #[error("A job with queueing lock '{queueing_lock}' is already waiting or running")]
    AlreadyEnqueued { queueing_lock: String },

    /// A finish or retry found the row not in `doing` status. Indicates a
    /// programming error or a concurrently reaped job; the worker logs and
    /// swallows it.
    #[error("Job {job_id} was not found or not in 'doing' status")]
    UnexpectedJobStatus { job_id: i64 },
}

/// A Result type alias for ProcrastinateError.
pub type Result<T> = core::result::Result<T, ProcrastinateError>;
