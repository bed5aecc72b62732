use indoc::formatdoc;
use sqlx::{query_as, query_scalar, PgExecutor};

use crate::errors::Result;
use crate::job::{Job, JobStatus};

/// Filters for [`list_jobs`]. Unset fields match everything.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub id: Option<i64>,
    pub queue_name: Option<String>,
    pub task_name: Option<String>,
    pub status: Option<JobStatus>,
    pub queueing_lock: Option<String>,
}

/// List jobs matching the filter, id-ascending.
pub async fn list_jobs(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    filter: &JobFilter,
) -> Result<Vec<Job>> {
    let sql = formatdoc!(
        r#"
            select id, queue_name, task_name, lock, queueing_lock,
                   args, status, scheduled_at, attempts
                from {escaped_schema}.procrastinate_jobs
                where ($1::bigint is null or id = $1)
                  and ($2::text is null or queue_name = $2)
                  and ($3::text is null or task_name = $3)
                  and ($4::text is null or status = $4)
                  and ($5::text is null or queueing_lock = $5)
                order by id asc;
        "#
    );

    let jobs = query_as(&sql)
        .bind(filter.id)
        .bind(&filter.queue_name)
        .bind(&filter.task_name)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(&filter.queueing_lock)
        .fetch_all(executor)
        .await?;

    Ok(jobs)
}

/// Move a `todo` row to `failed` and mark it with a `cancelled` event.
/// Returns false without touching anything else — notably a `doing` row:
/// cancelling running jobs is the worker's cooperative business.
pub async fn cancel_job(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    job_id: i64,
) -> Result<bool> {
    let sql = formatdoc!(
        r#"
            with cancelled as (
                update {escaped_schema}.procrastinate_jobs
                    set status = 'failed'
                    where id = $1::bigint and status = 'todo'
                    returning id
            )
            insert into {escaped_schema}.procrastinate_events (job_id, type)
                select id, 'cancelled' from cancelled
                returning job_id;
        "#
    );

    let cancelled: Option<i64> = query_scalar(&sql)
        .bind(job_id)
        .fetch_optional(executor)
        .await?;

    Ok(cancelled.is_some())
}

/// Delete terminal rows whose last event is older than `older_than_secs`.
/// `succeeded` rows always qualify; `failed` rows only when asked for.
pub async fn delete_old_jobs(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    older_than_secs: f64,
    queue: Option<&str>,
    include_failed: bool,
) -> Result<u64> {
    let mut statuses = vec![JobStatus::Succeeded.as_str()];
    if include_failed {
        statuses.push(JobStatus::Failed.as_str());
    }

    let sql = formatdoc!(
        r#"
            delete from {escaped_schema}.procrastinate_jobs as jobs
                where jobs.status = any($1::text[])
                  and ($2::text is null or jobs.queue_name = $2)
                  and (
                      select max(at)
                          from {escaped_schema}.procrastinate_events as events
                          where events.job_id = jobs.id
                  ) < now() - make_interval(secs => $3::double precision);
        "#
    );

    let result = sqlx::query(&sql)
        .bind(&statuses)
        .bind(queue)
        .bind(older_than_secs)
        .execute(executor)
        .await?;

    Ok(result.rows_affected())
}

/// Return stranded `doing` rows to `todo`.
///
/// A row is stranded when its latest `doing` event is older than
/// `max_duration_secs`, meaning its worker died without releasing it.
/// Attempts are left untouched so reaping is invisible to retry policies.
pub async fn reap_stalled_jobs(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    max_duration_secs: f64,
) -> Result<Vec<i64>> {
    let sql = formatdoc!(
        r#"
            update {escaped_schema}.procrastinate_jobs as jobs
                set status = 'todo', scheduled_at = null
                where jobs.status = 'doing'
                  and (
                      select max(at)
                          from {escaped_schema}.procrastinate_events as events
                          where events.job_id = jobs.id and events.type = 'doing'
                  ) < now() - make_interval(secs => $1::double precision)
                returning jobs.id;
        "#
    );

    let reaped = query_scalar(&sql)
        .bind(max_duration_secs)
        .fetch_all(executor)
        .await?;

    Ok(reaped)
}
