use indoc::formatdoc;
use sqlx::{query, PgExecutor};

use crate::errors::{ProcrastinateError, Result};
use crate::job::{JobOutcome, JobStatus};

/// Commit the outcome of an executed job. Success and failure go through
/// `procrastinate_finish_job`, a retry through `procrastinate_retry_job`;
/// all three increment the attempts counter and require the row to be in
/// `doing` status.
pub async fn finish_job(
    executor: impl for<'e> PgExecutor<'e>,
    escaped_schema: &str,
    job_id: i64,
    outcome: JobOutcome,
) -> Result<()> {
    let result = match outcome {
        JobOutcome::Success | JobOutcome::Failure => {
            let end_status = match outcome {
                JobOutcome::Success => JobStatus::Succeeded,
                _ => JobStatus::Failed,
            };

            let sql = formatdoc!(
                r#"
                    select {escaped_schema}.procrastinate_finish_job($1::bigint, $2::text);
                "#
            );

            query(&sql)
                .bind(job_id)
                .bind(end_status.as_str())
                .execute(executor)
                .await
        }
        JobOutcome::Retry(retry_at) => {
            let sql = formatdoc!(
                r#"
                    select {escaped_schema}.procrastinate_retry_job($1::bigint, $2::timestamptz);
                "#
            );

            query(&sql)
                .bind(job_id)
                .bind(retry_at)
                .execute(executor)
                .await
        }
    };

    result.map_err(|e| map_unexpected_status(e, job_id))?;

    Ok(())
}

/// The finish and retry procedures RAISE (sqlstate P0001) when the row is
/// not in `doing` status.
fn map_unexpected_status(e: sqlx::Error, job_id: i64) -> ProcrastinateError {
    if let sqlx::Error::Database(db_error) = &e {
        if db_error.code().as_deref() == Some("P0001") {
            return ProcrastinateError::UnexpectedJobStatus { job_id };
        }
    }

    e.into()
}
