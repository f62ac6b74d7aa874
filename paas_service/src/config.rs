//! Application configuration, read once from the environment at startup.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,

    // System of record + shared tenant engine (same MySQL instance)
    pub mysql_host: String,
    pub mysql_port: u16,
    pub mysql_database: String,
    pub mysql_user: String,
    pub mysql_password: String,

    // Queue store
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: String,

    // Domains
    pub base_domain: String,
    pub project_domain: String,
    pub acme_email: String,

    // Container runtime + filesystem layout
    pub docker_socket: String,
    pub docker_network: String,
    pub projects_root: PathBuf,
    pub templates_root: PathBuf,
    pub traefik_dynamic_template: PathBuf,
    pub traefik_dynamic_config: PathBuf,

    // Auth
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,

    // Deployment workers
    pub worker_count: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: get_env_parsed("PORT", 8080),

            mysql_host: get_env("MYSQL_HOST", "mysql"),
            mysql_port: get_env_parsed("MYSQL_PORT", 3306),
            mysql_database: get_env("MYSQL_DATABASE", "paas"),
            mysql_user: get_env("MYSQL_USER", "root"),
            mysql_password: get_env("MYSQL_PASSWORD", ""),

            redis_host: get_env("REDIS_HOST", "redis"),
            redis_port: get_env_parsed("REDIS_PORT", 6379),
            redis_password: get_env("REDIS_PASSWORD", ""),

            base_domain: get_env("BASE_DOMAIN", "localhost"),
            project_domain: get_env("PROJECT_DOMAIN", "p.localhost"),
            acme_email: get_env("ACME_EMAIL", "admin@localhost"),

            docker_socket: get_env("DOCKER_SOCKET", "/var/run/docker.sock"),
            docker_network: get_env("DOCKER_NETWORK", "paas-network"),
            projects_root: get_env("PROJECTS_PATH", "/app/storage/projects").into(),
            templates_root: get_env("TEMPLATES_PATH", "/app/docker/templates").into(),
            traefik_dynamic_template: get_env(
                "TRAEFIK_DYNAMIC_TEMPLATE_PATH",
                "/app/docker/traefik/dynamic.yml.template",
            )
            .into(),
            traefik_dynamic_config: get_env(
                "TRAEFIK_DYNAMIC_CONFIG_PATH",
                "/app/docker/traefik/dynamic.yml",
            )
            .into(),

            jwt_secret: get_env("JWT_SECRET", "change-this-secret"),
            jwt_expiry_hours: get_env_parsed("JWT_EXPIRY_HOURS", 24),

            worker_count: get_env_parsed("DEPLOY_WORKERS", 1),
        }
    }

    pub fn mysql_url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.mysql_user, self.mysql_password, self.mysql_host, self.mysql_port, self.mysql_database
        )
    }

    pub fn redis_url(&self) -> String {
        if self.redis_password.is_empty() {
            format!("redis://{}:{}/", self.redis_host, self.redis_port)
        } else {
            format!(
                "redis://:{}@{}:{}/",
                self.redis_password, self.redis_host, self.redis_port
            )
        }
    }
}

fn get_env(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

fn get_env_parsed<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_url_omits_empty_password() {
        let mut config = Config::from_env();
        config.redis_host = "cache".to_string();
        config.redis_port = 6379;
        config.redis_password = String::new();
        assert_eq!(config.redis_url(), "redis://cache:6379/");

        config.redis_password = "s3cret".to_string();
        assert_eq!(config.redis_url(), "redis://:s3cret@cache:6379/");
    }

    #[test]
    fn mysql_url_includes_all_parts() {
        let mut config = Config::from_env();
        config.mysql_user = "root".into();
        config.mysql_password = "pw".into();
        config.mysql_host = "db".into();
        config.mysql_port = 3306;
        config.mysql_database = "paas".into();
        assert_eq!(config.mysql_url(), "mysql://root:pw@db:3306/paas");
    }
}
