use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use getset::Getters;
use sqlx::FromRow;

/// Lifecycle status of a job row. Stored as text in the database.
#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum JobStatus {
    /// Ready to run, or scheduled for the future
    Todo,
    /// Claimed by exactly one worker
    Doing,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Todo => "todo",
            JobStatus::Doing => "doing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    /// Terminal rows are never re-animated (the janitor may delete them).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of work, as stored in `procrastinate_jobs`.
#[derive(FromRow, Getters, Debug, Clone, PartialEq, Eq)]
#[getset(get = "pub")]
pub struct Job {
    /// Unique identifier, assigned by the store on insert
    id: i64,
    queue_name: String,
    /// Name the worker resolves to a registered handler
    task_name: String,
    /// Execution lock: at most one `doing` job per non-null key
    lock: Option<String>,
    /// Admission lock: at most one `todo`/`doing` job per non-null key
    queueing_lock: Option<String>,
    /// The JSON arguments passed to the task handler
    args: serde_json::Value,
    status: JobStatus,
    /// Gate for the fetch path; `None` means ready immediately
    scheduled_at: Option<DateTime<Utc>>,
    /// Incremented only on transition out of `doing`
    attempts: i32,
}

impl Job {
    #[cfg(test)]
    pub(crate) fn for_tests(task_name: &str, args: serde_json::Value) -> Job {
        Job {
            id: 1,
            queue_name: "default".to_string(),
            task_name: task_name.to_string(),
            lock: None,
            queueing_lock: None,
            args,
            status: JobStatus::Doing,
            scheduled_at: None,
            attempts: 0,
        }
    }
}

/// Outcome reported to the store when releasing a `doing` job.
///
/// `Retry` is the one path that re-opens a row: the job returns to `todo`
/// with `scheduled_at` set to the retry time. All three variants increment
/// the attempts counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failure,
    Retry(DateTime<Utc>),
}
