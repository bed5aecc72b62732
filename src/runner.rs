use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{try_join, StreamExt, TryStreamExt};
use getset::Getters;
use procrastinate_shutdown_signal::{ShutdownHandle, ShutdownSignal};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::builder::WorkerParams;
use crate::errors::ProcrastinateError;
use crate::job::{Job, JobOutcome};
use crate::periodic::{periodic_main, PeriodicTask};
use crate::store::JobStore;
use crate::streams::{job_signal_stream, job_stream, StreamSource};
use crate::task::{TaskError, TaskRegistry};
use crate::JobContext;

/// How long a cancelled handler gets to observe its token and return
/// before the spawned task is hard-aborted.
const CANCEL_RESPONSE_WINDOW: Duration = Duration::from_secs(1);

/// How many consecutive fetch failures the worker tolerates before it
/// gives up on the database and stops.
const MAX_CONSECUTIVE_FETCH_FAILURES: u32 = 10;

/// The main worker struct that processes jobs from the queue.
///
/// A worker owns `concurrency` sub-workers: cooperative loops that fetch a
/// job, execute the matching task and report the outcome, sleeping on the
/// signal stream (NOTIFY or polling timer) when the ready set is empty.
/// The periodic deferrer runs alongside them in the same process.
#[derive(Getters)]
#[getset(get = "pub")]
pub struct Worker {
    /// Unique identifier for this worker instance
    pub(crate) worker_id: String,
    /// Maximum number of jobs processed concurrently
    pub(crate) concurrency: usize,
    /// How often to poll when no notification arrives
    pub(crate) poll_interval: Duration,
    /// Queue subset served by this worker; `None` serves every queue
    pub(crate) queues: Option<Vec<String>>,
    /// Registered task handlers, immutable after startup
    #[getset(skip)]
    pub(crate) registry: Arc<TaskRegistry>,
    /// Database façade shared with producers
    pub(crate) store: JobStore,
    /// Recurring tasks deferred by this worker's periodic scheduler
    #[getset(skip)]
    pub(crate) periodic_tasks: Vec<PeriodicTask>,
    /// Timezone used to evaluate cron expressions
    pub(crate) timezone: chrono::FixedOffset,
    /// Maximum number of missed periodic slots deferred after a late wake
    pub(crate) periodic_lookback: u32,
    /// Delay granted to in-flight jobs after shutdown is requested
    pub(crate) graceful_shutdown_timeout: Duration,
    /// Signal that stops fetching when triggered
    pub(crate) shutdown_signal: ShutdownSignal,
    /// Programmatic trigger for the shutdown signal
    #[getset(skip)]
    pub(crate) shutdown_handle: ShutdownHandle,
    #[getset(skip)]
    fetch_failures: AtomicU32,
}

/// Errors that can occur during worker runtime.
#[derive(Error, Debug)]
pub enum WorkerRuntimeError {
    /// An error occurred while processing or releasing a job
    #[error("Unexpected error occured while processing job : '{0}'")]
    ProcessJob(#[from] ProcessJobError),
    /// Failed to listen to PostgreSQL notifications for new jobs
    #[error("Failed to listen to postgres notifications : '{0}'")]
    PgListen(#[from] ProcrastinateError),
    /// An error occurred while deferring a periodic job
    #[error("Error occured while trying to defer periodic job : {0}")]
    Periodic(ProcrastinateError),
}

impl Worker {
    /// Creates a new `WorkerOptions` builder with default settings.
    pub fn options() -> crate::builder::WorkerOptions {
        crate::builder::WorkerOptions::default()
    }

    pub(crate) fn new(params: WorkerParams) -> Self {
        Worker {
            worker_id: params.worker_id,
            concurrency: params.concurrency,
            poll_interval: params.poll_interval,
            queues: params.queues,
            registry: Arc::new(params.registry),
            store: params.store,
            periodic_tasks: params.periodic_tasks,
            timezone: params.timezone,
            periodic_lookback: params.periodic_lookback,
            graceful_shutdown_timeout: params.graceful_shutdown_timeout,
            shutdown_signal: params.shutdown_signal,
            shutdown_handle: params.shutdown_handle,
            fetch_failures: AtomicU32::new(0),
        }
    }

    /// Runs the worker until the shutdown signal is triggered.
    ///
    /// The job runner and the periodic deferrer run concurrently. Shutdown
    /// is a two-phase drain: the signal stream stops yielding (no new
    /// fetches), in-flight jobs get `graceful_shutdown_timeout` to finish,
    /// then still-running handlers are cancelled and their jobs returned
    /// to the queue.
    pub async fn run(&self) -> Result<(), WorkerRuntimeError> {
        let job_runner = self.job_runner();
        let periodic_deferrer = async {
            periodic_main(
                &self.store,
                &self.periodic_tasks,
                self.timezone,
                self.periodic_lookback,
                self.shutdown_signal.clone(),
            )
            .await
            .map_err(WorkerRuntimeError::Periodic)
        };

        try_join!(job_runner, periodic_deferrer)?;

        Ok(())
    }

    /// Processes every job currently in the ready set, then returns.
    ///
    /// Unlike `run` this does not wait for notifications or poll; it is
    /// useful for batch draining and tests. An error in one job does not
    /// stop the others.
    pub async fn run_once(&self) -> Result<(), WorkerRuntimeError> {
        let job_stream = job_stream(
            self.store.clone(),
            self.queues.clone(),
            self.shutdown_signal.clone(),
        );

        job_stream
            .for_each_concurrent(self.concurrency, |job| async move {
                let job_id = *job.id();
                match run_and_release_job(Arc::new(job), self, &StreamSource::RunOnce).await {
                    Ok(_) => {
                        debug!(job_id, "Job processed");
                    }
                    Err(e) => {
                        error!(error = ?e, job_id, "Error while processing job");
                    }
                }
            })
            .await;

        Ok(())
    }

    async fn job_runner(&self) -> Result<(), WorkerRuntimeError> {
        let job_signal = job_signal_stream(
            self.store.connector(),
            self.queues.as_deref(),
            self.poll_interval,
            self.shutdown_signal.clone(),
            self.concurrency,
        )
        .await?;

        debug!(worker_id = self.worker_id, "Listening for jobs...");
        job_signal
            .map(Ok::<_, ProcessJobError>)
            .try_for_each_concurrent(self.concurrency, |source| async move {
                let res = process_one_job(self, source).await?;

                if let Some(job) = res {
                    debug!(job_id = job.id(), "Job processed");
                }

                Ok(())
            })
            .await?;

        Ok(())
    }

    /// Requests a graceful shutdown of the worker.
    ///
    /// Wakes all internal listeners waiting on the shutdown signal so that
    /// `run`/`run_once` loops exit once in-flight work has drained.
    pub fn request_shutdown(&self) {
        self.shutdown_handle.shutdown();
    }
}

/// Errors that can occur while processing a job.
#[derive(Error, Debug)]
pub enum ProcessJobError {
    /// Error occurred when trying to release a job after processing
    #[error("An error occured while releasing a job : '{0}'")]
    ReleaseJobError(#[from] ReleaseJobError),
    /// The database stayed unreachable past the fetch retry budget
    #[error("An error occured while fetching a job to run : '{0}'")]
    GetJobError(#[from] ProcrastinateError),
}

/// Fetches and processes a single job from the queue.
///
/// A fetch failure is tolerated (the next signal retries) until the
/// consecutive-failure budget runs out; only then does the worker stop.
async fn process_one_job(
    worker: &Worker,
    source: StreamSource,
) -> Result<Option<Job>, ProcessJobError> {
    let job = match worker.store.fetch_one(worker.queues.as_deref()).await {
        Ok(job) => {
            worker.fetch_failures.store(0, Ordering::Relaxed);
            job
        }
        Err(e) => {
            let failures = worker.fetch_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= MAX_CONSECUTIVE_FETCH_FAILURES {
                error!(error = ?e, failures, "Could not fetch job, retry budget exhausted");
                return Err(e.into());
            }
            warn!(error = ?e, failures, "Could not fetch job");
            return Ok(None);
        }
    };

    match job {
        Some(job) => {
            let job = Arc::new(job);
            run_and_release_job(job.clone(), worker, &source).await?;
            Ok(Some(
                Arc::try_unwrap(job).unwrap_or_else(|arc| (*arc).clone()),
            ))
        }
        None => {
            trace!(source = ?source, "No job found");
            Ok(None)
        }
    }
}

/// Errors that can occur during the execution of a job's task handler.
#[derive(Error, Debug)]
enum RunJobError {
    /// The fetched job names a task unknown to this worker
    #[error("No task named '{0}' is registered on this worker")]
    TaskNotFound(String),
    /// The task handler panicked during execution
    #[error("Task failed execution to complete : {0}")]
    TaskPanic(#[from] tokio::task::JoinError),
    /// The task handler finished with an error
    #[error("Task returned the following error : {0}")]
    Task(TaskError),
    /// The grace period expired and the handler did not react to its
    /// cancellation token
    #[error("Task was aborted by shutdown signal")]
    ShutdownAborted,
}

/// Executes a job's task handler and then commits the outcome.
async fn run_and_release_job(
    job: Arc<Job>,
    worker: &Worker,
    source: &StreamSource,
) -> Result<(), ProcessJobError> {
    let job_result = run_job(&job, worker, source).await;
    release_job(job_result, job, worker).await.map_err(|e| {
        error!(error = ?e, "Release job error");
        e
    })?;

    Ok(())
}

/// Executes a job's task handler function.
///
/// The handler runs on its own tokio task. When the shutdown signal fires,
/// the handler keeps the worker's grace period to finish; past it, its
/// cancellation token is cancelled and, failing a prompt reaction, the
/// task is aborted so the job can be returned to the queue.
async fn run_job(job: &Job, worker: &Worker, source: &StreamSource) -> Result<(), RunJobError> {
    let task_name = job.task_name();
    let Some(descriptor) = worker.registry.get(task_name) else {
        return Err(RunJobError::TaskNotFound(task_name.clone()));
    };

    debug!(source = ?source, job_id = job.id(), task_name, "Found task");

    let cancellation_token = CancellationToken::new();
    let ctx = JobContext::new(
        worker.store.connector().pool().clone(),
        job.clone(),
        worker.worker_id.clone(),
        cancellation_token.clone(),
    );

    let task_fut = (descriptor.runner())(ctx);

    let start = Instant::now();
    let mut job_task = tokio::spawn(task_fut);

    let mut shutdown_signal = worker.shutdown_signal.clone();
    let grace = worker.graceful_shutdown_timeout;
    let shutdown_timeout = async move {
        (&mut shutdown_signal).await;
        tokio::time::sleep(grace).await;
    };

    let result = tokio::select! {
        res = &mut job_task => flatten_task_result(res),
        _ = shutdown_timeout => {
            cancellation_token.cancel();
            match tokio::time::timeout(CANCEL_RESPONSE_WINDOW, &mut job_task).await {
                Ok(res) => flatten_task_result(res),
                Err(_) => {
                    job_task.abort();
                    warn!(
                        task_name,
                        job_id = job.id(),
                        "Job interrupted by shutdown signal after grace period"
                    );
                    Err(RunJobError::ShutdownAborted)
                }
            }
        }
    };
    result?;

    let duration = start.elapsed();
    info!(
        task_name,
        job_id = job.id(),
        duration = duration.as_millis(),
        "Completed task with success"
    );

    Ok(())
}

fn flatten_task_result(
    res: Result<Result<(), TaskError>, tokio::task::JoinError>,
) -> Result<(), RunJobError> {
    match res {
        Err(e) => Err(RunJobError::TaskPanic(e)),
        Ok(Err(e)) => Err(RunJobError::Task(e)),
        Ok(Ok(())) => Ok(()),
    }
}

/// Error that occurs when trying to commit a job outcome.
#[derive(Error, Debug)]
#[error("Failed to release job '{job_id}'. {source}")]
pub struct ReleaseJobError {
    job_id: i64,
    #[source]
    source: ProcrastinateError,
}

/// Commits the outcome of an executed job.
///
/// Success maps straight to `succeeded`. Errors go through the task's
/// retry policy with the new attempts count: a granted delay reschedules
/// the job, an exhausted or declined policy fails it. Aborts fail
/// immediately, and a job whose handler was killed by shutdown goes back
/// to `todo` so another worker picks it up.
async fn release_job(
    job_result: Result<(), RunJobError>,
    job: Arc<Job>,
    worker: &Worker,
) -> Result<(), ReleaseJobError> {
    let attempts = (job.attempts() + 1) as u32;

    let outcome = match &job_result {
        Ok(_) => JobOutcome::Success,
        Err(RunJobError::TaskNotFound(task_name)) => {
            error!(
                task_name,
                job_id = job.id(),
                "Task is not registered on this worker, failing the job"
            );
            JobOutcome::Failure
        }
        Err(RunJobError::ShutdownAborted) => JobOutcome::Retry(Utc::now()),
        Err(RunJobError::Task(TaskError::Abort)) => {
            warn!(job_id = job.id(), "Job aborted by its handler");
            JobOutcome::Failure
        }
        Err(e) => {
            let (kind, explicit_retry) = match e {
                RunJobError::Task(TaskError::Retry) => (None, true),
                RunJobError::Task(TaskError::Failure { kind, .. }) => (kind.as_deref(), false),
                RunJobError::TaskPanic(_) => (Some("panic"), false),
                _ => (None, false),
            };

            let policy = worker
                .registry
                .get(job.task_name())
                .map(|descriptor| descriptor.retry_policy());

            let delay = policy.and_then(|policy| {
                if explicit_retry {
                    // The handler asked for a retry: skip the kind
                    // allow-list, keep the attempts budget.
                    policy.delay_for(attempts)
                } else {
                    policy.retry_decision(attempts, kind)
                }
            });

            match delay {
                Some(delay) => {
                    warn!(
                        error = ?e,
                        task_name = job.task_name(),
                        job_id = job.id(),
                        attempts,
                        retry_in = ?delay,
                        "Failed task, will retry"
                    );
                    // Saturated policy delays do not fit a chrono duration;
                    // a century is as good as never.
                    let delay = chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::days(36500));
                    JobOutcome::Retry(Utc::now() + delay)
                }
                None => {
                    error!(
                        error = ?e,
                        task_name = job.task_name(),
                        job_id = job.id(),
                        attempts,
                        "Failed task, retry policy exhausted"
                    );
                    JobOutcome::Failure
                }
            }
        }
    };

    let finish_result = worker.store.finish(*job.id(), outcome).await;

    match finish_result {
        Ok(()) => Ok(()),
        // Concurrent reaping or a programming error; either way the row is
        // no longer ours to finish.
        Err(ProcrastinateError::UnexpectedJobStatus { job_id }) => {
            warn!(job_id, "Job was not in 'doing' status when finishing");
            Ok(())
        }
        Err(e) => Err(ReleaseJobError {
            job_id: *job.id(),
            source: e,
        }),
    }
}
