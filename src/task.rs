use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use getset::Getters;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::job::Job;
use crate::retry::RetryPolicy;

/// Error a task handler finishes with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Ask for the job to be rescheduled; the task's retry policy computes
    /// the delay from the new attempts count.
    Retry,
    /// Fail the job immediately, bypassing the retry policy. This is the
    /// cooperative-cancellation return path.
    Abort,
    /// Regular failure; the retry policy decides between retry and final
    /// failure, optionally keyed on `kind`.
    Failure {
        kind: Option<String>,
        message: String,
    },
}

impl TaskError {
    pub fn failure(message: impl Into<String>) -> Self {
        TaskError::Failure {
            kind: None,
            message: message.into(),
        }
    }

    pub fn failure_with_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        TaskError::Failure {
            kind: Some(kind.into()),
            message: message.into(),
        }
    }
}

impl Display for TaskError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::Retry => write!(f, "task requested a retry"),
            TaskError::Abort => write!(f, "task aborted"),
            TaskError::Failure { kind, message } => match kind {
                Some(kind) => write!(f, "task failed ({kind}): {message}"),
                None => write!(f, "task failed: {message}"),
            },
        }
    }
}

impl std::error::Error for TaskError {}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        TaskError::failure(message)
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        TaskError::failure(message)
    }
}

/// Conversion of handler return values into the worker's result type.
/// Implemented for `()` and for `Result<(), E>` where the error converts
/// into [`TaskError`].
pub trait IntoTaskResult {
    fn into_task_result(self) -> Result<(), TaskError>;
}

impl IntoTaskResult for () {
    fn into_task_result(self) -> Result<(), TaskError> {
        Ok(())
    }
}

impl<E: Into<TaskError>> IntoTaskResult for Result<(), E> {
    fn into_task_result(self) -> Result<(), TaskError> {
        self.map_err(Into::into)
    }
}

/// Everything a handler gets to see while running a job.
#[derive(Clone, Getters)]
#[getset(get = "pub")]
pub struct JobContext {
    /// Database connection pool, for handlers that defer follow-up jobs
    pg_pool: PgPool,
    /// The job row being executed
    job: Job,
    /// Identifier of the worker process executing the job
    worker_id: String,
    /// Cancelled once the worker's grace period has expired; handlers that
    /// honor it should return [`TaskError::Retry`] or [`TaskError::Abort`]
    cancellation_token: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(
        pg_pool: PgPool,
        job: Job,
        worker_id: String,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            pg_pool,
            job,
            worker_id,
            cancellation_token,
        }
    }
}

/// A named unit of work. The implementing type is the task's payload: it is
/// deserialized from the job's `args` and consumed by `run`.
///
/// ```rust
/// use procrastinate::{IntoTaskResult, JobContext, Task};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail {
///     to: String,
/// }
///
/// impl Task for SendEmail {
///     const NAME: &'static str = "email.send";
///
///     async fn run(self, _ctx: JobContext) -> impl IntoTaskResult {
///         println!("sending to {}", self.to);
///     }
/// }
/// ```
pub trait Task: Serialize + DeserializeOwned + Send + 'static {
    const NAME: &'static str;

    /// Retry policy consulted when `run` fails. Defaults to a single
    /// attempt.
    fn retry_policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    fn run(self, ctx: JobContext) -> impl Future<Output = impl IntoTaskResult> + Send;
}

/// Type-erased handler stored in the registry.
pub(crate) type TaskFn = Arc<
    dyn Fn(JobContext) -> Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>
        + Send
        + Sync,
>;

/// A registered task: the erased handler plus its retry policy.
#[derive(Clone)]
pub(crate) struct TaskDescriptor {
    runner: TaskFn,
    retry_policy: RetryPolicy,
}

impl TaskDescriptor {
    pub(crate) fn runner(&self) -> &TaskFn {
        &self.runner
    }

    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

/// Mapping from task name to handler descriptor.
///
/// Built at application startup and handed to the worker; immutable
/// afterwards, so concurrent sub-workers read it without locking.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskDescriptor>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under [`Task::NAME`]. A later registration with the
    /// same name replaces the earlier one.
    pub fn register<T: Task>(&mut self) -> &mut Self {
        let runner: TaskFn = Arc::new(|ctx: JobContext| {
            async move {
                let args = ctx.job().args().clone();
                let payload: T = serde_json::from_value(args).map_err(|e| {
                    TaskError::failure_with_kind(
                        "invalid_args",
                        format!("Failed to deserialize args for task '{}': {e}", T::NAME),
                    )
                })?;

                payload.run(ctx).await.into_task_result()
            }
            .boxed()
        });

        self.tasks.insert(
            T::NAME.to_string(),
            TaskDescriptor {
                runner,
                retry_policy: T::retry_policy(),
            },
        );
        self
    }

    pub(crate) fn get(&self, task_name: &str) -> Option<&TaskDescriptor> {
        self.tasks.get(task_name)
    }

    pub fn contains(&self, task_name: &str) -> bool {
        self.tasks.contains_key(task_name)
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
