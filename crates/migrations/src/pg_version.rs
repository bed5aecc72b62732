use indoc::formatdoc;
use sqlx::{query, PgExecutor, Row};

use crate::MigrateError;

/// Fetches the postgres version and checks that it can run procrastinate.
pub async fn fetch_and_check_postgres_version<'e, E>(executor: E) -> Result<u32, MigrateError>
where
    E: PgExecutor<'e>,
{
    let sql = formatdoc!(
        r#"
            select current_setting('server_version_num') as server_version_num
        "#
    );

    let row = query(&sql).fetch_one(executor).await?;
    let version_string: String = row.try_get("server_version_num")?;

    check_postgres_version(&version_string)
}

/// Checks that the given postgres version can run procrastinate.
pub fn check_postgres_version(version_string: &str) -> Result<u32, MigrateError> {
    let version = version_string.parse::<u32>()?;

    if version < 120000 {
        return Err(MigrateError::IncompatibleVersion(version));
    }

    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_supported_versions() {
        assert_eq!(check_postgres_version("120000").unwrap(), 120000);
        assert_eq!(check_postgres_version("130999").unwrap(), 130999);
        assert_eq!(check_postgres_version("160002").unwrap(), 160002);
    }

    #[test]
    fn rejects_old_or_unparsable_versions() {
        assert!(matches!(
            check_postgres_version("119999"),
            Err(MigrateError::IncompatibleVersion(119999))
        ));
        assert!(matches!(
            check_postgres_version("110000"),
            Err(MigrateError::IncompatibleVersion(110000))
        ));
        assert!(matches!(
            check_postgres_version("foo"),
            Err(MigrateError::ParseVersionError(_))
        ));
    }
}
