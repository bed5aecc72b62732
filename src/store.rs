use std::time::Duration;

use getset::Getters;
use procrastinate_migrations::{migrate, MigrateError};
use serde_json::Value;

use crate::connector::Connector;
use crate::errors::Result;
use crate::job::{Job, JobOutcome};
use crate::job_spec::DeferSpec;
use crate::sql::job_admin::JobFilter;
use crate::sql::{defer_job, fetch_job, finish_job, job_admin, periodic};
use crate::task::Task;

/// Stateless façade over the fixed set of database operations.
///
/// All SQL lives one layer down in `sql/`; producers and workers only ever
/// speak in domain terms (defer, fetch, finish, ...). Every mutating
/// operation is a single statement in its own transaction.
#[derive(Clone, Getters)]
#[getset(get = "pub")]
pub struct JobStore {
    connector: Connector,
    escaped_schema: String,
}

impl JobStore {
    pub fn new(connector: Connector, escaped_schema: String) -> Self {
        Self {
            connector,
            escaped_schema,
        }
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> std::result::Result<(), MigrateError> {
        migrate(self.connector.pool(), &self.escaped_schema).await
    }

    /// Enqueue a job. Fails with `AlreadyEnqueued` when the spec carries a
    /// queueing lock that another live job holds.
    pub async fn defer(
        &self,
        task_name: &str,
        args: Value,
        spec: impl Into<DeferSpec>,
    ) -> Result<i64> {
        defer_job::defer_job(
            self.connector.pool(),
            &self.escaped_schema,
            task_name,
            &args,
            &spec.into(),
        )
        .await
    }

    /// Enqueue a typed task payload under [`Task::NAME`].
    pub async fn defer_task<T: Task>(&self, payload: T, spec: impl Into<DeferSpec>) -> Result<i64> {
        let args = serde_json::to_value(payload)?;
        self.defer(T::NAME, args, spec).await
    }

    /// Atomically claim the next eligible job, or `None` when the ready
    /// set is empty. `queues = None` serves every queue.
    pub async fn fetch_one(&self, queues: Option<&[String]>) -> Result<Option<Job>> {
        fetch_job::fetch_job(self.connector.pool(), &self.escaped_schema, queues).await
    }

    /// Commit the outcome of a fetched job.
    pub async fn finish(&self, job_id: i64, outcome: JobOutcome) -> Result<()> {
        finish_job::finish_job(self.connector.pool(), &self.escaped_schema, job_id, outcome).await
    }

    /// List jobs matching the filter, id-ascending.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        job_admin::list_jobs(self.connector.pool(), &self.escaped_schema, filter).await
    }

    /// Cancel a waiting job. Returns false when the job is not in `todo`
    /// status — cancelling a running job is a no-op.
    pub async fn cancel_job(&self, job_id: i64) -> Result<bool> {
        job_admin::cancel_job(self.connector.pool(), &self.escaped_schema, job_id).await
    }

    /// Janitor: delete terminal rows older than `older_than`.
    pub async fn delete_old_jobs(
        &self,
        older_than: Duration,
        queue: Option<&str>,
        include_failed: bool,
    ) -> Result<u64> {
        job_admin::delete_old_jobs(
            self.connector.pool(),
            &self.escaped_schema,
            older_than.as_secs_f64(),
            queue,
            include_failed,
        )
        .await
    }

    /// Janitor: return `doing` rows stranded for longer than `max_duration`
    /// to `todo`, attempts unchanged. Returns the reaped job ids.
    pub async fn reap_stalled_jobs(&self, max_duration: Duration) -> Result<Vec<i64>> {
        job_admin::reap_stalled_jobs(
            self.connector.pool(),
            &self.escaped_schema,
            max_duration.as_secs_f64(),
        )
        .await
    }

    /// Enqueue the job for a periodic schedule slot, at most once per
    /// (task, slot) across the whole cluster. `None` means another
    /// deferrer already won the slot.
    pub async fn defer_periodic(
        &self,
        queue_name: &str,
        task_name: &str,
        defer_timestamp: i64,
        args: &Value,
    ) -> Result<Option<i64>> {
        periodic::defer_periodic_job(
            self.connector.pool(),
            &self.escaped_schema,
            queue_name,
            task_name,
            defer_timestamp,
            args,
        )
        .await
    }
}
