use indoc::formatdoc;
use sqlx::{query_scalar, PgExecutor};
use tracing::info;

use crate::errors::{ProcrastinateError, Result};
use crate::job_spec::{DeferSpec, DEFAULT_QUEUE};

/// Insert one `todo` row through `procrastinate_defer_job`. The queue
/// NOTIFY fires from an AFTER INSERT trigger, inside the same transaction,
/// so only committed deferrals are signalled.
pub async fn defer_job(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    task_name: &str,
    args: &serde_json::Value,
    spec: &DeferSpec,
) -> Result<i64> {
    let sql = formatdoc!(
        r#"
            select {escaped_schema}.procrastinate_defer_job(
                queue_name => $1::text,
                task_name => $2::text,
                lock => $3::text,
                queueing_lock => $4::text,
                args => $5::jsonb,
                scheduled_at => $6::timestamptz
            );
        "#
    );

    let queue_name = spec.queue_name().as_deref().unwrap_or(DEFAULT_QUEUE);

    let job_id: i64 = query_scalar(&sql)
        .bind(queue_name)
        .bind(task_name)
        .bind(spec.lock())
        .bind(spec.queueing_lock())
        .bind(args)
        .bind(spec.scheduled_at())
        .fetch_one(executor)
        .await
        .map_err(|e| map_queueing_lock_violation(e, spec.queueing_lock()))?;

    info!(task_name, queue_name, job_id, "Job deferred");

    Ok(job_id)
}

/// The partial unique index over live statuses is the admission check; a
/// violation on it means the queueing lock is taken, not a bug.
fn map_queueing_lock_violation(
    e: sqlx::Error,
    queueing_lock: &Option<String>,
) -> ProcrastinateError {
    if let sqlx::Error::Database(db_error) = &e {
        if db_error.code().as_deref() == Some("23505")
            && db_error.constraint() == Some("procrastinate_jobs_queueing_lock_idx")
        {
            return ProcrastinateError::AlreadyEnqueued {
                queueing_lock: queueing_lock.clone().unwrap_or_default(),
            };
        }
    }

    e.into()
}
