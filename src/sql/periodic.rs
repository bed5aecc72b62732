use indoc::formatdoc;
use sqlx::{query_scalar, PgExecutor};

use crate::errors::Result;

/// Conditional insert of a (task, slot) pair plus the defer of the job,
/// all inside `procrastinate_defer_periodic_job`. Returns the enqueued job
/// id, or `None` when another deferrer already won the slot.
pub async fn defer_periodic_job(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    queue_name: &str,
    task_name: &str,
    defer_timestamp: i64,
    args: &serde_json::Value,
) -> Result<Option<i64>> {
    let sql = formatdoc!(
        r#"
            select {escaped_schema}.procrastinate_defer_periodic_job(
                $1::text, $2::text, $3::bigint, $4::jsonb
            );
        "#
    );

    let job_id: Option<i64> = query_scalar(&sql)
        .bind(queue_name)
        .bind(task_name)
        .bind(defer_timestamp)
        .bind(args)
        .fetch_one(executor)
        .await?;

    Ok(job_id)
}
