use std::time::Duration;

use chrono::FixedOffset;
use procrastinate_cron::CronSchedule;
use procrastinate_migrations::MigrateError;
use procrastinate_shutdown_signal::{ShutdownHandle, ShutdownSignal};
use rand::RngCore;
use sqlx::PgPool;
use thiserror::Error;

use crate::connector::Connector;
use crate::errors::ProcrastinateError;
use crate::job_spec::DEFAULT_QUEUE;
use crate::periodic::PeriodicTask;
use crate::runner::Worker;
use crate::sql::escape_identifier;
use crate::store::JobStore;
use crate::task::{Task, TaskRegistry};

/// Builder for [`Worker`]. Collects connection settings, the task
/// registry, periodic schedules and runtime knobs, then `init()` connects,
/// migrates and produces the worker.
#[derive(Default)]
pub struct WorkerOptions {
    concurrency: Option<usize>,
    poll_interval: Option<Duration>,
    registry: TaskRegistry,
    periodic_tasks: Vec<PeriodicTask>,
    pg_pool: Option<PgPool>,
    database_url: Option<String>,
    pool_size: Option<u32>,
    schema: Option<String>,
    queues: Option<Vec<String>>,
    timezone: Option<FixedOffset>,
    periodic_lookback: Option<u32>,
    graceful_shutdown_timeout: Option<Duration>,
    shutdown_signal: Option<ShutdownSignal>,
}

#[derive(Error, Debug)]
pub enum WorkerBuildError {
    #[error("Error occured while connecting to the postgres database : {0}")]
    ConnectError(#[from] sqlx::Error),
    #[error("Error occured while querying : {0}")]
    QueryError(#[from] ProcrastinateError),
    #[error("Error occured while migrating : {0}")]
    MigrateError(#[from] MigrateError),
    #[error("Missing database_url config")]
    MissingDatabaseUrl,
}

pub(crate) struct WorkerParams {
    pub(crate) worker_id: String,
    pub(crate) concurrency: usize,
    pub(crate) poll_interval: Duration,
    pub(crate) queues: Option<Vec<String>>,
    pub(crate) registry: TaskRegistry,
    pub(crate) store: JobStore,
    pub(crate) periodic_tasks: Vec<PeriodicTask>,
    pub(crate) timezone: FixedOffset,
    pub(crate) periodic_lookback: u32,
    pub(crate) graceful_shutdown_timeout: Duration,
    pub(crate) shutdown_signal: ShutdownSignal,
    pub(crate) shutdown_handle: ShutdownHandle,
}

impl WorkerOptions {
    pub async fn init(self) -> Result<Worker, WorkerBuildError> {
        let connector = match self.pg_pool {
            Some(pg_pool) => Connector::from_pool(pg_pool),
            None => {
                let db_url = self
                    .database_url
                    .ok_or(WorkerBuildError::MissingDatabaseUrl)?;

                Connector::connect(&db_url, self.pool_size.unwrap_or(20))
                    .await
                    .map_err(|e| match e {
                        ProcrastinateError::SqlError(e) => WorkerBuildError::ConnectError(e),
                        e => WorkerBuildError::QueryError(e),
                    })?
            }
        };

        let schema = self.schema.unwrap_or_else(|| String::from("public"));
        let escaped_schema = escape_identifier(connector.pool(), &schema).await?;

        let store = JobStore::new(connector, escaped_schema);
        store.migrate().await?;

        let mut random_bytes = [0u8; 9];
        rand::thread_rng().fill_bytes(&mut random_bytes);

        let shutdown_handle = ShutdownHandle::new();
        let shutdown_signal = shutdown_handle.signal(self.shutdown_signal);

        let worker = Worker::new(WorkerParams {
            worker_id: format!("procrastinate_worker_{}", hex::encode(random_bytes)),
            concurrency: self.concurrency.unwrap_or_else(num_cpus::get),
            poll_interval: self.poll_interval.unwrap_or(Duration::from_secs(5)),
            queues: self.queues,
            registry: self.registry,
            store,
            periodic_tasks: self.periodic_tasks,
            timezone: self.timezone.unwrap_or_else(|| FixedOffset::east_opt(0).unwrap()),
            periodic_lookback: self.periodic_lookback.unwrap_or(1),
            graceful_shutdown_timeout: self
                .graceful_shutdown_timeout
                .unwrap_or(Duration::from_secs(5)),
            shutdown_signal,
            shutdown_handle,
        });

        Ok(worker)
    }

    /// Schema the procrastinate tables live in (default: `public`).
    pub fn schema(mut self, value: &str) -> Self {
        self.schema = Some(value.into());
        self
    }

    /// Number of jobs processed concurrently (default: number of CPUs).
    pub fn concurrency(mut self, value: usize) -> Self {
        self.concurrency = Some(value);
        self
    }

    /// How often to poll for jobs when NOTIFY is silent (default: 5s).
    pub fn polling_interval(mut self, value: Duration) -> Self {
        self.poll_interval = Some(value);
        self
    }

    pub fn pg_pool(mut self, value: PgPool) -> Self {
        self.pg_pool = Some(value);
        self
    }

    pub fn database_url(mut self, value: &str) -> Self {
        self.database_url = Some(value.into());
        self
    }

    /// Connector pool size (default: 20). Ignored when a pool is supplied.
    pub fn pool_size(mut self, value: u32) -> Self {
        self.pool_size = Some(value);
        self
    }

    /// Restrict this worker to a subset of queues (default: serve all).
    pub fn queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = Some(queues.into_iter().map(Into::into).collect());
        self
    }

    /// Timezone cron expressions are evaluated in (default: UTC). Always
    /// explicit; the process environment is never consulted.
    pub fn timezone(mut self, value: FixedOffset) -> Self {
        self.timezone = Some(value);
        self
    }

    /// Maximum number of missed periodic slots deferred after a late wake
    /// (default: 1, the most recent slot only).
    pub fn periodic_lookback(mut self, value: u32) -> Self {
        self.periodic_lookback = Some(value);
        self
    }

    /// Delay granted to in-flight jobs once shutdown is requested, before
    /// their cancellation tokens fire (default: 5s).
    pub fn graceful_shutdown_timeout(mut self, value: Duration) -> Self {
        self.graceful_shutdown_timeout = Some(value);
        self
    }

    /// External shutdown source merged with the worker's own stop handle
    /// (typically [`procrastinate_shutdown_signal::shutdown_signal`] for
    /// OS signals).
    pub fn shutdown_signal(mut self, value: ShutdownSignal) -> Self {
        self.shutdown_signal = Some(value);
        self
    }

    /// Register task `T` under [`Task::NAME`].
    pub fn define_task<T: Task>(mut self) -> Self {
        self.registry.register::<T>();
        self
    }

    /// Schedule task `T` periodically: one job per schedule slot, deferred
    /// to the default queue with `args` (plus the slot timestamp) as
    /// payload. Safe to configure on every worker of a cluster.
    pub fn periodic<T: Task>(self, schedule: CronSchedule, args: serde_json::Value) -> Self {
        self.periodic_in_queue::<T>(DEFAULT_QUEUE, schedule, args)
    }

    /// Like [`Self::periodic`], routed to a specific queue.
    pub fn periodic_in_queue<T: Task>(
        mut self,
        queue_name: &str,
        schedule: CronSchedule,
        args: serde_json::Value,
    ) -> Self {
        self.periodic_tasks.push(PeriodicTask {
            task_name: T::NAME.to_string(),
            queue_name: queue_name.to_string(),
            schedule,
            args,
        });
        self
    }
}
