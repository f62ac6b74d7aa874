//! Platform settings store.
//!
//! Key/value rows tuned by instructors (project quota, serving domains).
//! Read-mostly and deliberately uncached: the pipeline re-reads the project
//! domain on every run so an admin change applies to the next deployment.

use tracing::warn;

use crate::config::Config;
use crate::database::{Database, Result};
use crate::models::Setting;

pub const KEY_MAX_PROJECTS: &str = "max_projects_per_user";
pub const KEY_BASE_DOMAIN: &str = "base_domain";
pub const KEY_PROJECT_DOMAIN: &str = "project_domain";

#[derive(Clone)]
pub struct SettingsStore {
    db: Database,
}

impl SettingsStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Seed the rows the platform depends on, leaving existing values alone.
    pub async fn ensure_defaults(&self, config: &Config) -> Result<()> {
        let defaults = [
            (
                KEY_MAX_PROJECTS,
                "3".to_string(),
                "Maximum live projects per student",
                "int",
            ),
            (
                KEY_BASE_DOMAIN,
                config.base_domain.clone(),
                "Domain the panel itself is served under",
                "string",
            ),
            (
                KEY_PROJECT_DOMAIN,
                config.project_domain.clone(),
                "Parent domain for project subdomains",
                "string",
            ),
        ];

        for (key, value, description, value_type) in defaults {
            sqlx::query(
                "INSERT IGNORE INTO settings (setting_key, value, description, value_type) VALUES (?, ?, ?, ?)",
            )
            .bind(key)
            .bind(value)
            .bind(description)
            .bind(value_type)
            .execute(self.db.pool())
            .await?;
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let value =
            sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE setting_key = ?")
                .bind(key)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(value)
    }

    /// Lookup with a fallback. Errors degrade to the fallback so a flaky
    /// settings read cannot take down a deployment.
    pub async fn get_or(&self, key: &str, default: &str) -> String {
        match self.get(key).await {
            Ok(Some(value)) if !value.trim().is_empty() => value,
            Ok(_) => default.to_string(),
            Err(err) => {
                warn!(key, %err, "Settings lookup failed, using default");
                default.to_string()
            }
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (setting_key, value) VALUES (?, ?) \
             ON DUPLICATE KEY UPDATE value = VALUES(value)",
        )
        .bind(key)
        .bind(value)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn all(&self) -> Result<Vec<Setting>> {
        let settings = sqlx::query_as::<_, Setting>(
            "SELECT id, setting_key, value, description, value_type FROM settings ORDER BY setting_key",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(settings)
    }
}
