//! Reverse-proxy routing contract.
//!
//! Two halves: the container labels that steer Traefik's docker provider at
//! each deployment, and the file-provider config rendered from a template
//! when an admin changes the serving domains.
//!
//! Labels implement the blue/green scheme: every deployment gets its own
//! router (`<subdomain>-<unix_ts>`) but all deployments of a project share
//! one service named after the subdomain. While old and new containers both
//! carry the service, Traefik health-checks decide which backend takes
//! traffic, so the cut-over needs no config push.

use std::io::Write;
use std::path::Path;

use tracing::info;

#[derive(Debug)]
pub enum RenderError {
    Io(std::io::Error),
    Persist(tempfile::PersistError),
}

impl std::fmt::Display for RenderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderError::Io(err) => write!(f, "proxy config render failed: {}", err),
            RenderError::Persist(err) => write!(f, "proxy config replace failed: {}", err),
        }
    }
}

impl std::error::Error for RenderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RenderError::Io(err) => Some(err),
            RenderError::Persist(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for RenderError {
    fn from(err: std::io::Error) -> Self {
        RenderError::Io(err)
    }
}

impl From<tempfile::PersistError> for RenderError {
    fn from(err: tempfile::PersistError) -> Self {
        RenderError::Persist(err)
    }
}

type Result<T> = std::result::Result<T, RenderError>;

/// Routing labels for one deployment's container.
pub fn router_labels(subdomain: &str, project_domain: &str, deploy_ts: i64) -> Vec<String> {
    let router = format!("{}-{}", subdomain, deploy_ts);
    vec![
        "traefik.enable=true".to_string(),
        format!(
            "traefik.http.routers.{}.rule=Host(`{}.{}`)",
            router, subdomain, project_domain
        ),
        format!("traefik.http.routers.{}.service={}", router, subdomain),
        format!(
            "traefik.http.services.{}.loadbalancer.server.port=80",
            subdomain
        ),
        format!(
            "traefik.http.services.{}.loadbalancer.healthcheck.path=/health",
            subdomain
        ),
        format!(
            "traefik.http.services.{}.loadbalancer.healthcheck.interval=2s",
            subdomain
        ),
    ]
}

/// Render the file-provider config from its template, substituting the
/// domain placeholders.
///
/// The write is atomic: a temp file in the output directory, chmod 0644,
/// then rename over the target. Traefik watches the file and must never see
/// it half-written.
pub fn render_dynamic_config(
    template_path: &Path,
    output_path: &Path,
    base_domain: &str,
    project_domain: &str,
) -> Result<()> {
    let template = std::fs::read_to_string(template_path)?;
    let content = template
        .replace("{{BASE_DOMAIN}}", base_domain.trim())
        .replace("{{PROJECT_DOMAIN}}", project_domain.trim());

    let output_dir = output_path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(output_dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(output_dir)?;
    tmp.write_all(content.as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    }

    tmp.persist(output_path)?;

    info!(
        base_domain,
        project_domain,
        output = %output_path.display(),
        "Proxy dynamic config rendered"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_follow_the_blue_green_scheme() {
        let labels = router_labels("blog-abc123", "p.example.edu", 1700000000);
        assert_eq!(
            labels,
            vec![
                "traefik.enable=true".to_string(),
                "traefik.http.routers.blog-abc123-1700000000.rule=Host(`blog-abc123.p.example.edu`)"
                    .to_string(),
                "traefik.http.routers.blog-abc123-1700000000.service=blog-abc123".to_string(),
                "traefik.http.services.blog-abc123.loadbalancer.server.port=80".to_string(),
                "traefik.http.services.blog-abc123.loadbalancer.healthcheck.path=/health"
                    .to_string(),
                "traefik.http.services.blog-abc123.loadbalancer.healthcheck.interval=2s"
                    .to_string(),
            ]
        );
    }

    #[test]
    fn router_is_per_deployment_but_service_is_shared() {
        let first = router_labels("app-x", "p.test", 100);
        let second = router_labels("app-x", "p.test", 200);
        assert_ne!(first[1], second[1]);
        assert_eq!(first[3], second[3]);
    }

    #[test]
    fn render_substitutes_and_replaces_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("dynamic.yml.template");
        let output = dir.path().join("out/dynamic.yml");
        std::fs::write(
            &template,
            "panel: {{BASE_DOMAIN}}\nprojects: {{PROJECT_DOMAIN}}\n",
        )
        .unwrap();

        render_dynamic_config(&template, &output, "example.edu", "p.example.edu").unwrap();
        let rendered = std::fs::read_to_string(&output).unwrap();
        assert_eq!(rendered, "panel: example.edu\nprojects: p.example.edu\n");

        // Re-render over the existing file
        render_dynamic_config(&template, &output, "other.edu", " p.other.edu ").unwrap();
        let rendered = std::fs::read_to_string(&output).unwrap();
        assert_eq!(rendered, "panel: other.edu\nprojects: p.other.edu\n");
    }

    #[cfg(unix)]
    #[test]
    fn rendered_file_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("t");
        let output = dir.path().join("dynamic.yml");
        std::fs::write(&template, "x").unwrap();

        render_dynamic_config(&template, &output, "a", "b").unwrap();
        let mode = std::fs::metadata(&output).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn missing_template_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = render_dynamic_config(
            &dir.path().join("nope"),
            &dir.path().join("out.yml"),
            "a",
            "b",
        );
        assert!(matches!(result, Err(RenderError::Io(_))));
    }
}
