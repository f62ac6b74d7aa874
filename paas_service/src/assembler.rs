//! Build context assembly.
//!
//! Materializes everything one image build needs under
//! `<projects_root>/<subdomain>/`: the cloned source, the runtime-matched
//! Dockerfile, nginx and supervisor configs, and a synthesized `.env`
//! wiring the app to its tenant database. Purely filesystem-side-effecting;
//! the container runtime and the store are not touched from here.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::config::Config;
use crate::models::Project;
use runtime_outils::{git, manifest};

/// Supervisor program block appended when the project runs a queue worker.
/// The sleep gives php-fpm and the database connection time to come up.
const QUEUE_WORKER_PROGRAM: &str = r#"
[program:laravel-worker]
process_name=%(program_name)s_%(process_num)02d
command=/bin/sh -c "sleep 20 && php /var/www/html/artisan queue:work database --sleep=3 --tries=3"
autostart=true
autorestart=true
user=www-data
numprocs=1
redirect_stderr=true
stdout_logfile=/dev/stdout
stdout_logfile_maxbytes=0
"#;

#[derive(Debug)]
pub enum AssembleError {
    Clone(git::Error),
    Detect(manifest::Error),
    Stage(std::io::Error),
    Env(std::io::Error),
}

impl std::fmt::Display for AssembleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssembleError::Clone(err) => write!(f, "Failed to clone repository: {}", err),
            AssembleError::Detect(err) => write!(f, "Failed to detect Laravel version: {}", err),
            AssembleError::Stage(err) => write!(f, "Failed to stage build context: {}", err),
            AssembleError::Env(err) => write!(f, "Failed to write project environment: {}", err),
        }
    }
}

impl std::error::Error for AssembleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AssembleError::Clone(err) => Some(err),
            AssembleError::Detect(err) => Some(err),
            AssembleError::Stage(err) | AssembleError::Env(err) => Some(err),
        }
    }
}

type Result<T> = std::result::Result<T, AssembleError>;

/// A finished build context plus the versions the build was resolved to.
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub path: PathBuf,
    pub framework_version: String,
    pub runtime_version: String,
    pub project_domain: String,
}

#[derive(Clone)]
pub struct Assembler {
    projects_root: PathBuf,
    templates_root: PathBuf,
    mysql_host: String,
    mysql_port: u16,
}

impl Assembler {
    pub fn new(config: &Config) -> Self {
        Self {
            projects_root: config.projects_root.clone(),
            templates_root: config.templates_root.clone(),
            mysql_host: config.mysql_host.clone(),
            mysql_port: config.mysql_port,
        }
    }

    /// Produce the build context for one deployment.
    pub async fn assemble(&self, project: &Project, project_domain: &str) -> Result<AssembledContext> {
        let context_dir = self.projects_root.join(&project.subdomain);

        git::clone_project(&project.source_url, &project.branch, &context_dir)
            .await
            .map_err(AssembleError::Clone)?;

        let detected = manifest::detect_versions(&context_dir)
            .await
            .map_err(AssembleError::Detect)?;

        // A manually pinned runtime wins over detection.
        let runtime_version = if project.manual_runtime_version {
            project
                .runtime_version
                .clone()
                .filter(|v| !v.is_empty())
                .unwrap_or(detected.runtime_version)
        } else {
            detected.runtime_version
        };

        stage_templates(
            &self.templates_root,
            &context_dir,
            &runtime_version,
            project.queue_worker_enabled,
        )
        .await
        .map_err(AssembleError::Stage)?;

        write_env(
            &context_dir,
            project,
            project_domain,
            &self.mysql_host,
            self.mysql_port,
        )
        .await
        .map_err(AssembleError::Env)?;

        info!(
            subdomain = %project.subdomain,
            framework = %detected.framework_major,
            runtime = %runtime_version,
            "Build context assembled"
        );

        Ok(AssembledContext {
            path: context_dir,
            framework_version: detected.framework_major,
            runtime_version,
            project_domain: project_domain.to_string(),
        })
    }
}

/// Template file name for a runtime version, e.g. `8.3` → `Dockerfile.php83`.
fn dockerfile_template_name(runtime_version: &str) -> String {
    format!("Dockerfile.php{}", runtime_version.replace('.', ""))
}

/// Copy the Dockerfile and the nginx/supervisor configs into the context,
/// appending the queue worker program when enabled.
async fn stage_templates(
    templates_root: &Path,
    context_dir: &Path,
    runtime_version: &str,
    queue_worker_enabled: bool,
) -> std::io::Result<()> {
    tokio::fs::copy(
        templates_root.join(dockerfile_template_name(runtime_version)),
        context_dir.join("Dockerfile"),
    )
    .await?;

    let docker_dir = context_dir.join("docker");
    tokio::fs::create_dir_all(&docker_dir).await?;
    tokio::fs::copy(
        templates_root.join("nginx.conf"),
        docker_dir.join("nginx.conf"),
    )
    .await?;
    tokio::fs::copy(
        templates_root.join("supervisord.conf"),
        docker_dir.join("supervisord.conf"),
    )
    .await?;

    if queue_worker_enabled {
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(docker_dir.join("supervisord.conf"))
            .await?;
        file.write_all(QUEUE_WORKER_PROGRAM.as_bytes()).await?;
        file.flush().await?;
    }

    Ok(())
}

/// Synthesize the application `.env`.
///
/// The database, username and password are all the project's database name;
/// the in-browser query tool authenticates with the same triple.
async fn write_env(
    context_dir: &Path,
    project: &Project,
    project_domain: &str,
    mysql_host: &str,
    mysql_port: u16,
) -> std::io::Result<()> {
    let mut key = [0u8; 32];
    rand::thread_rng().fill(&mut key[..]);
    let app_key = BASE64.encode(key);

    let queue_connection = if project.queue_worker_enabled {
        "database"
    } else {
        "sync"
    };

    let content = format!(
        r#"APP_NAME="{name}"
APP_ENV=production
APP_KEY=base64:{app_key}
APP_DEBUG=true
APP_URL=https://{subdomain}.{project_domain}

DB_CONNECTION=mysql
DB_HOST={mysql_host}
DB_PORT={mysql_port}
DB_DATABASE={database}
DB_USERNAME={database}
DB_PASSWORD={database}

CACHE_DRIVER=file
SESSION_DRIVER=file
QUEUE_CONNECTION={queue_connection}
"#,
        name = project.name,
        app_key = app_key,
        subdomain = project.subdomain,
        project_domain = project_domain,
        mysql_host = mysql_host,
        mysql_port = mysql_port,
        database = project.database_name,
        queue_connection = queue_connection,
    );

    tokio::fs::write(context_dir.join(".env"), content).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_project;

    fn fixture_dirs() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let templates = root.path().join("templates");
        let context = root.path().join("ctx");
        std::fs::create_dir_all(&templates).unwrap();
        std::fs::create_dir_all(&context).unwrap();
        std::fs::write(templates.join("Dockerfile.php83"), "FROM php:8.3-fpm\n").unwrap();
        std::fs::write(templates.join("nginx.conf"), "server {}\n").unwrap();
        std::fs::write(templates.join("supervisord.conf"), "[supervisord]\n").unwrap();
        (root, templates, context)
    }

    #[test]
    fn dockerfile_name_strips_the_dot() {
        assert_eq!(dockerfile_template_name("8.3"), "Dockerfile.php83");
        assert_eq!(dockerfile_template_name("8.0"), "Dockerfile.php80");
    }

    #[tokio::test]
    async fn stages_templates_into_the_context() {
        let (_root, templates, context) = fixture_dirs();

        stage_templates(&templates, &context, "8.3", false)
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(context.join("Dockerfile")).unwrap(),
            "FROM php:8.3-fpm\n"
        );
        assert!(context.join("docker/nginx.conf").exists());
        let supervisor = std::fs::read_to_string(context.join("docker/supervisord.conf")).unwrap();
        assert!(!supervisor.contains("laravel-worker"));
    }

    #[tokio::test]
    async fn queue_worker_block_is_appended_when_enabled() {
        let (_root, templates, context) = fixture_dirs();

        stage_templates(&templates, &context, "8.3", true)
            .await
            .unwrap();

        let supervisor = std::fs::read_to_string(context.join("docker/supervisord.conf")).unwrap();
        assert!(supervisor.starts_with("[supervisord]"));
        assert!(supervisor.contains("[program:laravel-worker]"));
        assert!(supervisor.contains("queue:work database --sleep=3 --tries=3"));
    }

    #[tokio::test]
    async fn missing_dockerfile_template_fails_staging() {
        let (_root, templates, context) = fixture_dirs();

        assert!(stage_templates(&templates, &context, "7.4", false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn env_wires_the_tenant_database_triple() {
        let (_root, _templates, context) = fixture_dirs();
        let project = test_project();

        write_env(&context, &project, "p.example.edu", "paas-mysql", 3306)
            .await
            .unwrap();

        let env = std::fs::read_to_string(context.join(".env")).unwrap();
        assert!(env.contains("APP_NAME=\"Blog\""));
        assert!(env.contains("APP_ENV=production"));
        assert!(env.contains("APP_URL=https://blog-abc123.p.example.edu"));
        assert!(env.contains("DB_HOST=paas-mysql"));
        assert!(env.contains("DB_DATABASE=blog"));
        assert!(env.contains("DB_USERNAME=blog"));
        assert!(env.contains("DB_PASSWORD=blog"));
        assert!(env.contains("QUEUE_CONNECTION=sync"));

        let key_line = env
            .lines()
            .find(|line| line.starts_with("APP_KEY=base64:"))
            .unwrap();
        let decoded = BASE64
            .decode(key_line.trim_start_matches("APP_KEY=base64:"))
            .unwrap();
        assert_eq!(decoded.len(), 32);
    }

    #[tokio::test]
    async fn env_uses_database_queue_when_worker_enabled() {
        let (_root, _templates, context) = fixture_dirs();
        let mut project = test_project();
        project.queue_worker_enabled = true;

        write_env(&context, &project, "p.example.edu", "paas-mysql", 3306)
            .await
            .unwrap();

        let env = std::fs::read_to_string(context.join(".env")).unwrap();
        assert!(env.contains("QUEUE_CONNECTION=database"));
    }
}
