//! Tenant database provisioning on the shared MySQL engine.
//!
//! Each project gets a database plus a same-named user granted on it. The
//! statements run over an admin connection pool rather than shelling into
//! the MySQL container.

use sqlx::MySqlPool;
use tracing::{info, warn};

#[derive(Debug)]
pub enum Error {
    Sql(sqlx::Error),
    InvalidName(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Sql(err) => write!(f, "database provisioning failed: {}", err),
            Error::InvalidName(name) => write!(f, "invalid database name: {}", name),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Sql(err) => Some(err),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Sql(err)
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Admin handle for creating and dropping tenant databases.
#[derive(Clone)]
pub struct MysqlAdmin {
    pool: MySqlPool,
}

impl MysqlAdmin {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Create the tenant database and its user. Idempotent.
    ///
    /// MySQL cannot bind identifiers, so the name is validated to
    /// `[a-z0-9_]` before interpolation. The user's password equals the
    /// database name: the in-browser query tool authenticates with exactly
    /// this triple, so all three legs must stay identical.
    pub async fn create_database(&self, name: &str) -> Result<()> {
        validate_identifier(name)?;

        sqlx::query(&format!("CREATE DATABASE IF NOT EXISTS `{}`", name))
            .execute(&self.pool)
            .await?;

        sqlx::query(&format!(
            "CREATE USER IF NOT EXISTS '{}'@'%' IDENTIFIED BY '{}'",
            name, name
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "GRANT ALL PRIVILEGES ON `{}`.* TO '{}'@'%'",
            name, name
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query("FLUSH PRIVILEGES").execute(&self.pool).await?;

        info!(database = name, "Tenant database ensured");
        Ok(())
    }

    /// Drop the tenant database and user. Errors are swallowed: deletion
    /// must make progress even when the engine never saw this tenant.
    pub async fn drop_database(&self, name: &str) {
        if validate_identifier(name).is_err() {
            warn!(database = name, "Refusing to drop invalid database name");
            return;
        }

        if let Err(err) = sqlx::query(&format!("DROP DATABASE IF EXISTS `{}`", name))
            .execute(&self.pool)
            .await
        {
            warn!(database = name, %err, "Dropping tenant database failed");
        }

        if let Err(err) = sqlx::query(&format!("DROP USER IF EXISTS '{}'@'%'", name))
            .execute(&self.pool)
            .await
        {
            warn!(database = name, %err, "Dropping tenant user failed");
        }
    }
}

/// Tenant names are restricted well below what MySQL allows: lowercase
/// alphanumerics and underscore, max 64 bytes.
pub fn validate_identifier(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_names() {
        assert!(validate_identifier("blog").is_ok());
        assert!(validate_identifier("my_app_2").is_ok());
    }

    #[test]
    fn rejects_hostile_names() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("Has-Caps").is_err());
        assert!(validate_identifier("semi;colon").is_err());
        assert!(validate_identifier("back`tick").is_err());
        assert!(validate_identifier("space name").is_err());
        assert!(validate_identifier(&"x".repeat(65)).is_err());
    }
}
