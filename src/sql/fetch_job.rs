use indoc::formatdoc;
use sqlx::{query_as, PgExecutor};

use crate::errors::Result;
use crate::job::Job;

/// Claim the next eligible job in a single round trip.
///
/// `procrastinate_fetch_job` selects the smallest-id ready row with
/// `FOR UPDATE SKIP LOCKED`, flips it to `doing` and returns it; a row of
/// nulls comes back when the ready set is empty, filtered out here.
pub async fn fetch_job(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    queues: Option<&[String]>,
) -> Result<Option<Job>> {
    let sql = formatdoc!(
        r#"
            select id, queue_name, task_name, lock, queueing_lock,
                   args, status, scheduled_at, attempts
                from {escaped_schema}.procrastinate_fetch_job($1::text[])
                where id is not null;
        "#
    );

    let job = query_as(&sql).bind(queues).fetch_optional(executor).await?;

    Ok(job)
}
