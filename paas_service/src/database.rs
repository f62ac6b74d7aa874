//! Database Infrastructure Layer
//!
//! Connection handling and schema bootstrap for the system of record.
//! Stores (projects, settings) build on this; business rules live there,
//! not here.

use std::ops::Deref;

use sqlx::mysql::MySqlPoolOptions;
use sqlx::MySqlPool;
use tracing::info;

use crate::config::Config;

#[derive(Debug)]
pub enum DatabaseError {
    Connection(sqlx::Error),
    Query(sqlx::Error),
    NotFound(String),
    Conflict(String),
    QuotaExceeded,
}

impl std::fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatabaseError::Connection(err) => write!(f, "Database connection error: {}", err),
            DatabaseError::Query(err) => write!(f, "Database query error: {}", err),
            DatabaseError::NotFound(msg) => write!(f, "Not found: {}", msg),
            DatabaseError::Conflict(msg) => write!(f, "{}", msg),
            DatabaseError::QuotaExceeded => write!(f, "Project limit reached"),
        }
    }
}

impl std::error::Error for DatabaseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DatabaseError::Connection(err) | DatabaseError::Query(err) => Some(err),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        DatabaseError::Query(err)
    }
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(Clone)]
pub struct Database {
    pool: MySqlPool,
}

impl Deref for Database {
    type Target = MySqlPool;
    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl Database {
    pub async fn connect(config: &Config) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .connect(&config.mysql_url())
            .await
            .map_err(DatabaseError::Connection)?;

        let db = Self { pool };
        db.initialize_tables().await?;

        info!(
            host = %config.mysql_host,
            database = %config.mysql_database,
            "Database initialized"
        );
        Ok(db)
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    async fn initialize_tables(&self) -> Result<()> {
        // Uniqueness of subdomain / database_name is over live rows only
        // (deleted_at IS NULL), which MySQL cannot express as an index.
        // The project store enforces it in its create transaction.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id BIGINT AUTO_INCREMENT PRIMARY KEY,
                owner_id BIGINT NOT NULL,
                name VARCHAR(255) NOT NULL,
                source_url VARCHAR(500) NOT NULL,
                branch VARCHAR(200) NOT NULL DEFAULT 'main',
                subdomain VARCHAR(100) NOT NULL,
                database_name VARCHAR(100) NOT NULL,
                status VARCHAR(20) NOT NULL DEFAULT 'pending',
                container_id VARCHAR(100) NULL,
                runtime_version VARCHAR(20) NULL,
                framework_version VARCHAR(20) NULL,
                manual_runtime_version BOOLEAN NOT NULL DEFAULT FALSE,
                queue_worker_enabled BOOLEAN NOT NULL DEFAULT FALSE,
                error_log TEXT NULL,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
                deleted_at TIMESTAMP NULL DEFAULT NULL,
                KEY idx_projects_owner (owner_id),
                KEY idx_projects_status_active (status, deleted_at),
                KEY idx_projects_subdomain (subdomain),
                KEY idx_projects_database_name (database_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                id BIGINT AUTO_INCREMENT PRIMARY KEY,
                setting_key VARCHAR(100) NOT NULL UNIQUE,
                value TEXT NOT NULL,
                description VARCHAR(500) NULL,
                value_type VARCHAR(20) NOT NULL DEFAULT 'string'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
