use sqlx::{query_as, Executor, FromRow, Postgres};

use crate::errors::Result;

pub(crate) mod defer_job;
pub(crate) mod fetch_job;
pub(crate) mod finish_job;
pub(crate) mod job_admin;
pub(crate) mod periodic;

#[derive(FromRow)]
struct EscapeIdentifierRow {
    escaped_identifier: String,
}

/// Escape a schema name through the database's own quoting rules so it is
/// safe to interpolate into statements.
pub(crate) async fn escape_identifier<'e, E: Executor<'e, Database = Postgres>>(
    executor: E,
    identifier: &str,
) -> Result<String> {
    let result: EscapeIdentifierRow =
        query_as("select format('%I', $1::text) as escaped_identifier")
            .bind(identifier)
            .fetch_one(executor)
            .await?;

    Ok(result.escaped_identifier)
}
