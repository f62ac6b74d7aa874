//! Project Store
//!
//! The authoritative record of projects. All SQL touching the `projects`
//! table lives here; only the HTTP layer and the deployment pipeline call
//! in. Responsibilities:
//! - create with the per-owner quota and live-row uniqueness rules
//! - tombstone purge: a create colliding with a soft-deleted row hard-deletes
//!   the stale row inside the same transaction, freeing its slots
//! - status transitions written back by the pipeline
//! - listing/search for the admin views

use crate::database::{Database, DatabaseError, Result};
use crate::models::{Project, ProjectStatus};

const DEFAULT_MAX_PROJECTS_PER_OWNER: i64 = 3;

const PROJECT_COLUMNS: &str = "id, owner_id, name, source_url, branch, subdomain, database_name, \
     status, container_id, runtime_version, framework_version, manual_runtime_version, \
     queue_worker_enabled, error_log, created_at, updated_at, deleted_at";

#[derive(Debug, Clone)]
pub struct NewProject {
    pub owner_id: i64,
    pub name: String,
    pub source_url: String,
    pub branch: String,
    pub subdomain: String,
    pub database_name: String,
    pub queue_worker_enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub page: i64,
    pub limit: i64,
    pub status: Option<ProjectStatus>,
    pub search: Option<String>,
}

#[derive(Clone)]
pub struct ProjectStore {
    db: Database,
}

impl ProjectStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a project, enforcing the per-owner quota and live-row
    /// uniqueness of `subdomain` and `database_name`.
    ///
    /// Soft-deleted rows still holding either key are purged first, inside
    /// the transaction, so their slots can be reused immediately.
    pub async fn create(&self, new: NewProject) -> Result<Project> {
        let mut tx = self.db.begin().await?;

        let max_projects: i64 =
            sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE setting_key = ?")
                .bind("max_projects_per_user")
                .fetch_optional(&mut *tx)
                .await?
                .and_then(|value| value.parse().ok())
                .unwrap_or(DEFAULT_MAX_PROJECTS_PER_OWNER);

        let owned: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM projects WHERE owner_id = ? AND deleted_at IS NULL",
        )
        .bind(new.owner_id)
        .fetch_one(&mut *tx)
        .await?;

        if owned >= max_projects {
            return Err(DatabaseError::QuotaExceeded);
        }

        sqlx::query(
            "DELETE FROM projects WHERE deleted_at IS NOT NULL AND (subdomain = ? OR database_name = ?)",
        )
        .bind(&new.subdomain)
        .bind(&new.database_name)
        .execute(&mut *tx)
        .await?;

        let database_taken: Option<i64> =
            sqlx::query_scalar("SELECT id FROM projects WHERE deleted_at IS NULL AND database_name = ?")
                .bind(&new.database_name)
                .fetch_optional(&mut *tx)
                .await?;
        if database_taken.is_some() {
            return Err(DatabaseError::Conflict(
                "Database name already in use".to_string(),
            ));
        }

        let subdomain_taken: Option<i64> =
            sqlx::query_scalar("SELECT id FROM projects WHERE deleted_at IS NULL AND subdomain = ?")
                .bind(&new.subdomain)
                .fetch_optional(&mut *tx)
                .await?;
        if subdomain_taken.is_some() {
            return Err(DatabaseError::Conflict("Subdomain already in use".to_string()));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO projects
                (owner_id, name, source_url, branch, subdomain, database_name, status, queue_worker_enabled)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new.owner_id)
        .bind(&new.name)
        .bind(&new.source_url)
        .bind(&new.branch)
        .bind(&new.subdomain)
        .bind(&new.database_name)
        .bind(ProjectStatus::Pending.as_str())
        .bind(new.queue_worker_enabled)
        .execute(&mut *tx)
        .await?;

        let id = result.last_insert_id() as i64;
        tx.commit().await?;

        self.find(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Project {} vanished after create", id)))
    }

    pub async fn find(&self, id: i64) -> Result<Option<Project>> {
        let project = sqlx::query_as::<_, Project>(&format!(
            "SELECT {} FROM projects WHERE id = ? AND deleted_at IS NULL",
            PROJECT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(project)
    }

    pub async fn list_own(&self, owner_id: i64) -> Result<Vec<Project>> {
        let projects = sqlx::query_as::<_, Project>(&format!(
            "SELECT {} FROM projects WHERE owner_id = ? AND deleted_at IS NULL ORDER BY created_at DESC",
            PROJECT_COLUMNS
        ))
        .bind(owner_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(projects)
    }

    /// Paginated listing with optional status filter and name/subdomain
    /// substring search. Returns the page plus the total match count.
    pub async fn list_all(&self, params: &ListParams) -> Result<(Vec<Project>, i64)> {
        let page = params.page.max(1);
        let limit = params.limit.clamp(1, 100);
        let offset = (page - 1) * limit;
        let pattern = params.search.as_ref().map(|s| format!("%{}%", s));

        let mut where_clause = String::from("deleted_at IS NULL");
        if params.status.is_some() {
            where_clause.push_str(" AND status = ?");
        }
        if pattern.is_some() {
            where_clause.push_str(" AND (name LIKE ? OR subdomain LIKE ?)");
        }

        let count_sql = format!("SELECT COUNT(*) FROM projects WHERE {}", where_clause);
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        if let Some(status) = params.status {
            count_query = count_query.bind(status.as_str());
        }
        if let Some(pattern) = &pattern {
            count_query = count_query.bind(pattern).bind(pattern);
        }
        let total = count_query.fetch_one(self.db.pool()).await?;

        let list_sql = format!(
            "SELECT {} FROM projects WHERE {} ORDER BY created_at DESC LIMIT ? OFFSET ?",
            PROJECT_COLUMNS, where_clause
        );
        let mut list_query = sqlx::query_as::<_, Project>(&list_sql);
        if let Some(status) = params.status {
            list_query = list_query.bind(status.as_str());
        }
        if let Some(pattern) = &pattern {
            list_query = list_query.bind(pattern).bind(pattern);
        }
        let projects = list_query
            .bind(limit)
            .bind(offset)
            .fetch_all(self.db.pool())
            .await?;

        Ok((projects, total))
    }

    pub async fn count_live(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM projects WHERE deleted_at IS NULL")
            .fetch_one(self.db.pool())
            .await?;
        Ok(count)
    }

    pub async fn count_by_status(&self, status: ProjectStatus) -> Result<i64> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM projects WHERE status = ? AND deleted_at IS NULL",
        )
        .bind(status.as_str())
        .fetch_one(self.db.pool())
        .await?;
        Ok(count)
    }

    pub async fn subdomain_in_use(&self, subdomain: &str) -> Result<bool> {
        let id: Option<i64> =
            sqlx::query_scalar("SELECT id FROM projects WHERE deleted_at IS NULL AND subdomain = ?")
                .bind(subdomain)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(id.is_some())
    }

    /// Entry transition of a deployment: Building, with the previous error
    /// log cleared in the same write.
    pub async fn begin_build(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE projects SET status = ?, error_log = NULL WHERE id = ?")
            .bind(ProjectStatus::Building.as_str())
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    pub async fn fail(&self, id: i64, message: &str) -> Result<()> {
        sqlx::query("UPDATE projects SET status = ?, error_log = ? WHERE id = ?")
            .bind(ProjectStatus::Failed.as_str())
            .bind(message)
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Promotion: the project is serving from the given container.
    pub async fn promote(&self, id: i64, container_id: &str) -> Result<()> {
        sqlx::query("UPDATE projects SET status = ?, container_id = ? WHERE id = ?")
            .bind(ProjectStatus::Running.as_str())
            .bind(container_id)
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    pub async fn set_versions(&self, id: i64, framework: &str, runtime: &str) -> Result<()> {
        sqlx::query("UPDATE projects SET framework_version = ?, runtime_version = ? WHERE id = ?")
            .bind(framework)
            .bind(runtime)
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Owner-facing settings. A manual runtime version pins the project to
    /// it until cleared; applying either change requires a redeploy.
    pub async fn update_config(
        &self,
        id: i64,
        runtime_version: Option<&str>,
        queue_worker_enabled: Option<bool>,
    ) -> Result<()> {
        if let Some(runtime) = runtime_version {
            sqlx::query(
                "UPDATE projects SET runtime_version = ?, manual_runtime_version = TRUE WHERE id = ?",
            )
            .bind(runtime)
            .bind(id)
            .execute(self.db.pool())
            .await?;
        }
        if let Some(enabled) = queue_worker_enabled {
            sqlx::query("UPDATE projects SET queue_worker_enabled = ? WHERE id = ?")
                .bind(enabled)
                .bind(id)
                .execute(self.db.pool())
                .await?;
        }
        Ok(())
    }

    /// Remove the row outright, releasing its subdomain and database-name
    /// slots. Deletion does not tombstone: external resources are already
    /// gone by the time this runs.
    pub async fn hard_delete(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}
