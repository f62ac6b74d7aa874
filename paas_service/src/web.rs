//! HTTP API
//!
//! JSON surface for students and admins:
//! - `POST /projects` - create a project and queue its first deployment
//! - `GET /projects` - caller's own projects
//! - `GET/PUT/DELETE /projects/{id}` - inspect, reconfigure, tear down
//! - `POST /projects/{id}/redeploy` - queue a redeployment
//! - `GET /projects/{id}/logs|stats` - container diagnostics
//! - `GET/PUT /projects/{id}/env` - environment file (updates redeploy)
//! - `GET /admin/projects|queue/stats|settings|stats` - operator views
//!
//! Students only reach rows they own; admin capabilities lift that. Every
//! failure body is `{"error": "..."}`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::auth::{AuthUser, RequireAdmin, RequireAuth};
use crate::backend::DockerBackend;
use crate::config::Config;
use crate::models::{generate_subdomain, Project, ProjectStatus};
use crate::pipeline::Pipeline;
use crate::project_store::{ListParams, NewProject, ProjectStore};
use crate::queue::{JobKind, JobQueue};
use crate::settings::{SettingsStore, KEY_BASE_DOMAIN, KEY_PROJECT_DOMAIN};
use crate::traefik;
use runtime_outils::docker::DockerCli;
use runtime_outils::mysql::validate_identifier;

const SUBDOMAIN_ATTEMPTS: usize = 5;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: ProjectStore,
    pub settings: SettingsStore,
    pub queue: JobQueue,
    pub docker: DockerCli,
    pub pipeline: Arc<Pipeline<DockerBackend, ProjectStore>>,
}

type ApiError = (StatusCode, Json<serde_json::Value>);
type ApiResult<T> = Result<T, ApiError>;

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn internal(context: &str, err: impl std::fmt::Display) -> ApiError {
    error!("{}: {}", context, err);
    api_error(StatusCode::INTERNAL_SERVER_ERROR, context)
}

/// Project row plus its public URL, as returned by every project endpoint.
#[derive(serde::Serialize)]
struct ProjectBody<'a> {
    #[serde(flatten)]
    project: &'a Project,
    url: String,
}

impl<'a> ProjectBody<'a> {
    fn new(project: &'a Project, project_domain: &str) -> Self {
        Self {
            project,
            url: format!("https://{}", project.full_domain(project_domain)),
        }
    }
}

async fn project_domain(state: &AppState) -> String {
    state
        .settings
        .get_or(KEY_PROJECT_DOMAIN, &state.config.project_domain)
        .await
}

/// Load a project the caller is allowed to see. Rows owned by others are
/// indistinguishable from missing ones.
async fn load_project(state: &AppState, id: i64, auth: &AuthUser) -> ApiResult<Project> {
    match state.store.find(id).await {
        Ok(Some(project))
            if auth.capabilities.list_all || project.owner_id == auth.user_id =>
        {
            Ok(project)
        }
        Ok(_) => Err(api_error(StatusCode::NOT_FOUND, "Project not found")),
        Err(err) => Err(internal("Failed to load project", err)),
    }
}

// ============================================================================
// Project endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateProjectRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    source_url: String,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    database_name: String,
    #[serde(default)]
    queue_worker_enabled: bool,
}

async fn create_project(
    State(state): State<AppState>,
    RequireAuth(auth): RequireAuth,
    Json(req): Json<CreateProjectRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    if req.name.trim().is_empty()
        || req.source_url.trim().is_empty()
        || req.database_name.trim().is_empty()
    {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Name, source URL, and database name are required",
        ));
    }
    if validate_identifier(&req.database_name).is_err() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Database name may only contain lowercase letters, digits, and underscores",
        ));
    }

    // Fresh suffixes until the label is free; the create transaction is the
    // real uniqueness gate.
    let mut subdomain = generate_subdomain(&req.name);
    for _ in 0..SUBDOMAIN_ATTEMPTS {
        match state.store.subdomain_in_use(&subdomain).await {
            Ok(false) => break,
            Ok(true) => subdomain = generate_subdomain(&req.name),
            Err(err) => return Err(internal("Failed to create project", err)),
        }
    }

    let project = state
        .store
        .create(NewProject {
            owner_id: auth.user_id,
            name: req.name.trim().to_string(),
            source_url: req.source_url.trim().to_string(),
            branch: req
                .branch
                .filter(|b| !b.trim().is_empty())
                .unwrap_or_else(|| "main".to_string()),
            subdomain,
            database_name: req.database_name.trim().to_string(),
            queue_worker_enabled: req.queue_worker_enabled,
        })
        .await
        .map_err(|err| match err {
            crate::database::DatabaseError::QuotaExceeded => {
                api_error(StatusCode::FORBIDDEN, "Project limit reached")
            }
            crate::database::DatabaseError::Conflict(message) => {
                api_error(StatusCode::CONFLICT, message)
            }
            other => internal("Failed to create project", other),
        })?;

    let queue_position = match state
        .queue
        .enqueue(project.id, auth.user_id, JobKind::Deploy)
        .await
    {
        Ok(position) => position,
        Err(err) => {
            let _ = state
                .store
                .fail(project.id, &format!("Failed to enqueue deployment: {}", err))
                .await;
            return Err(internal("Failed to enqueue deployment", err));
        }
    };

    info!(
        project_id = project.id,
        owner_id = auth.user_id,
        subdomain = %project.subdomain,
        queue_position,
        "Project created"
    );

    let domain = project_domain(&state).await;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "project": ProjectBody::new(&project, &domain),
            "message": "Deployment queued",
            "url": format!("https://{}", project.full_domain(&domain)),
            "queue_position": queue_position,
        })),
    ))
}

async fn list_projects(
    State(state): State<AppState>,
    RequireAuth(auth): RequireAuth,
) -> ApiResult<Json<serde_json::Value>> {
    let projects = state
        .store
        .list_own(auth.user_id)
        .await
        .map_err(|err| internal("Failed to list projects", err))?;

    let domain = project_domain(&state).await;
    let data: Vec<_> = projects
        .iter()
        .map(|project| ProjectBody::new(project, &domain))
        .collect();
    Ok(Json(json!({ "data": data })))
}

async fn get_project(
    State(state): State<AppState>,
    RequireAuth(auth): RequireAuth,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = load_project(&state, id, &auth).await?;
    let domain = project_domain(&state).await;
    Ok(Json(json!(ProjectBody::new(&project, &domain))))
}

#[derive(Debug, Deserialize)]
struct UpdateProjectRequest {
    runtime_version: Option<String>,
    queue_worker_enabled: Option<bool>,
}

async fn update_project(
    State(state): State<AppState>,
    RequireAuth(auth): RequireAuth,
    Path(id): Path<i64>,
    Json(req): Json<UpdateProjectRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = load_project(&state, id, &auth).await?;

    state
        .store
        .update_config(
            project.id,
            req.runtime_version.as_deref(),
            req.queue_worker_enabled,
        )
        .await
        .map_err(|err| internal("Failed to update project", err))?;

    let updated = load_project(&state, id, &auth).await?;
    let domain = project_domain(&state).await;
    Ok(Json(json!({ "project": ProjectBody::new(&updated, &domain) })))
}

async fn redeploy_project(
    State(state): State<AppState>,
    RequireAuth(auth): RequireAuth,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = load_project(&state, id, &auth).await?;

    let queue_position = state
        .queue
        .enqueue(project.id, auth.user_id, JobKind::Redeploy)
        .await
        .map_err(|err| internal("Failed to enqueue redeployment", err))?;

    info!(project_id = project.id, queue_position, "Redeployment queued");
    Ok(Json(json!({
        "message": "Redeployment queued",
        "queue_position": queue_position,
    })))
}

async fn delete_project(
    State(state): State<AppState>,
    RequireAuth(auth): RequireAuth,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = load_project(&state, id, &auth).await?;

    state
        .pipeline
        .teardown(&project)
        .await
        .map_err(|err| internal("Failed to delete project", err))?;

    info!(project_id = id, "Project deleted");
    Ok(Json(json!({ "message": "Project deleted successfully" })))
}

// ============================================================================
// Diagnostics
// ============================================================================

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<u32>,
}

async fn project_logs(
    State(state): State<AppState>,
    RequireAuth(auth): RequireAuth,
    Path(id): Path<i64>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = load_project(&state, id, &auth).await?;
    let Some(container_id) = &project.container_id else {
        return Err(api_error(StatusCode::BAD_REQUEST, "Container not running"));
    };

    let logs = state
        .docker
        .logs(container_id, query.lines.unwrap_or(100))
        .await
        .map_err(|err| internal("Failed to get logs", err))?;
    Ok(Json(json!({ "logs": logs })))
}

async fn project_stats(
    State(state): State<AppState>,
    RequireAuth(auth): RequireAuth,
    Path(id): Path<i64>,
) -> ApiResult<Json<runtime_outils::docker::ContainerStats>> {
    let project = load_project(&state, id, &auth).await?;
    let Some(container_id) = &project.container_id else {
        return Err(api_error(StatusCode::BAD_REQUEST, "Container not running"));
    };

    let stats = state
        .docker
        .stats(container_id)
        .await
        .map_err(|err| internal("Failed to get stats", err))?;
    Ok(Json(stats))
}

// ============================================================================
// Environment file
// ============================================================================

async fn get_env(
    State(state): State<AppState>,
    RequireAuth(auth): RequireAuth,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = load_project(&state, id, &auth).await?;
    let path = state.config.projects_root.join(&project.subdomain).join(".env");

    match tokio::fs::read_to_string(&path).await {
        Ok(content) => Ok(Json(json!({ "content": content }))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(api_error(
            StatusCode::NOT_FOUND,
            "Environment file not found; deploy the project first",
        )),
        Err(err) => Err(internal("Failed to read environment file", err)),
    }
}

#[derive(Debug, Deserialize)]
struct UpdateEnvRequest {
    content: String,
}

/// The `.env` is baked into the image at build time, so a bare file write
/// would silently change nothing. Updating it queues a redeploy.
async fn update_env(
    State(state): State<AppState>,
    RequireAuth(auth): RequireAuth,
    Path(id): Path<i64>,
    Json(req): Json<UpdateEnvRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let project = load_project(&state, id, &auth).await?;
    let dir = state.config.projects_root.join(&project.subdomain);

    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|err| internal("Failed to write environment file", err))?;
    tokio::fs::write(dir.join(".env"), req.content)
        .await
        .map_err(|err| internal("Failed to write environment file", err))?;

    let queue_position = state
        .queue
        .enqueue(project.id, auth.user_id, JobKind::Redeploy)
        .await
        .map_err(|err| internal("Failed to enqueue redeployment", err))?;

    Ok(Json(json!({
        "message": "Environment updated, redeployment queued",
        "queue_position": queue_position,
    })))
}

// ============================================================================
// Admin endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
struct AdminListQuery {
    page: Option<i64>,
    limit: Option<i64>,
    status: Option<String>,
    search: Option<String>,
}

async fn admin_list_projects(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    Query(query): Query<AdminListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(raw.parse::<ProjectStatus>().map_err(|err| {
            api_error(StatusCode::BAD_REQUEST, err)
        })?),
        None => None,
    };

    let params = ListParams {
        page: query.page.unwrap_or(1),
        limit: query.limit.unwrap_or(10),
        status,
        search: query.search.filter(|s| !s.is_empty()),
    };

    let (projects, total) = state
        .store
        .list_all(&params)
        .await
        .map_err(|err| internal("Failed to list projects", err))?;

    let domain = project_domain(&state).await;
    let data: Vec<_> = projects
        .iter()
        .map(|project| ProjectBody::new(project, &domain))
        .collect();
    Ok(Json(json!({
        "data": data,
        "total": total,
        "page": params.page,
        "limit": params.limit,
    })))
}

async fn admin_queue_stats(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
) -> ApiResult<Json<serde_json::Value>> {
    let stats = state
        .queue
        .stats()
        .await
        .map_err(|err| internal("Failed to get queue stats", err))?;
    Ok(Json(json!({ "stats": stats })))
}

async fn admin_list_settings(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
) -> ApiResult<Json<serde_json::Value>> {
    let settings = state
        .settings
        .all()
        .await
        .map_err(|err| internal("Failed to list settings", err))?;
    Ok(Json(json!({ "data": settings })))
}

#[derive(Debug, Deserialize)]
struct UpdateSettingRequest {
    value: String,
}

async fn admin_update_setting(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    Path(key): Path<String>,
    Json(req): Json<UpdateSettingRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state
        .settings
        .set(&key, req.value.trim())
        .await
        .map_err(|err| internal("Failed to update setting", err))?;

    // Domain changes must reach the proxy's file provider immediately.
    if key == KEY_BASE_DOMAIN || key == KEY_PROJECT_DOMAIN {
        let base = state
            .settings
            .get_or(KEY_BASE_DOMAIN, &state.config.base_domain)
            .await;
        let project = state
            .settings
            .get_or(KEY_PROJECT_DOMAIN, &state.config.project_domain)
            .await;
        traefik::render_dynamic_config(
            &state.config.traefik_dynamic_template,
            &state.config.traefik_dynamic_config,
            &base,
            &project,
        )
        .map_err(|err| internal("Failed to render proxy config", err))?;
    }

    info!(key = %key, "Setting updated");
    Ok(Json(json!({ "message": "Setting updated" })))
}

async fn admin_overview(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
) -> ApiResult<Json<serde_json::Value>> {
    let total_projects = state
        .store
        .count_live()
        .await
        .map_err(|err| internal("Failed to get project counts", err))?;
    let running_projects = state
        .store
        .count_by_status(ProjectStatus::Running)
        .await
        .map_err(|err| internal("Failed to get project counts", err))?;
    let queue_length = state
        .queue
        .len()
        .await
        .map_err(|err| internal("Failed to get queue length", err))?;

    Ok(Json(json!({
        "total_projects": total_projects,
        "running_projects": running_projects,
        "queue_length": queue_length,
    })))
}

async fn health() -> &'static str {
    "OK"
}

// ============================================================================
// Router
// ============================================================================

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/projects", post(create_project).get(list_projects))
        .route(
            "/projects/{id}",
            get(get_project).put(update_project).delete(delete_project),
        )
        .route("/projects/{id}/redeploy", post(redeploy_project))
        .route("/projects/{id}/logs", get(project_logs))
        .route("/projects/{id}/stats", get(project_stats))
        .route("/projects/{id}/env", get(get_env).put(update_env))
        .route("/admin/projects", get(admin_list_projects))
        .route("/admin/queue/stats", get(admin_queue_stats))
        .route("/admin/settings", get(admin_list_settings))
        .route("/admin/settings/{key}", put(admin_update_setting))
        .route("/admin/stats", get(admin_overview))
}
