//! Domain models for the control plane.
//!
//! `Project` is the central entity: one deployed student application, its
//! source location, its uniqueness keys (subdomain, database name) and the
//! observable deployment state. `Setting` rows hold instructor-tunable
//! platform configuration.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

// ============================================================================
// Project Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Pending,
    Building,
    Running,
    Failed,
    Stopped,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Pending => "pending",
            ProjectStatus::Building => "building",
            ProjectStatus::Running => "running",
            ProjectStatus::Failed => "failed",
            ProjectStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ProjectStatus::Pending),
            "building" => Ok(ProjectStatus::Building),
            "running" => Ok(ProjectStatus::Running),
            "failed" => Ok(ProjectStatus::Failed),
            "stopped" => Ok(ProjectStatus::Stopped),
            _ => Err(format!("Invalid project status: {}", s)),
        }
    }
}

impl TryFrom<String> for ProjectStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ============================================================================
// Project
// ============================================================================

/// A deployed student application.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Project {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub source_url: String,
    pub branch: String,
    pub subdomain: String,
    pub database_name: String,
    #[sqlx(try_from = "String")]
    pub status: ProjectStatus,
    pub container_id: Option<String>,
    pub runtime_version: Option<String>,
    pub framework_version: Option<String>,
    pub manual_runtime_version: bool,
    pub queue_worker_enabled: bool,
    pub error_log: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Project {
    /// Host name the application is served under.
    pub fn full_domain(&self, project_domain: &str) -> String {
        format!("{}.{}", self.subdomain, project_domain)
    }

    /// Image tag for this project's builds.
    pub fn image_tag(&self) -> String {
        format!("paas-{}", self.subdomain)
    }
}

// ============================================================================
// Setting
// ============================================================================

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Setting {
    pub id: i64,
    pub setting_key: String,
    pub value: String,
    pub description: Option<String>,
    pub value_type: String,
}

// ============================================================================
// Subdomain generation
// ============================================================================

const SUBDOMAIN_SUFFIX_LEN: usize = 6;
const SUBDOMAIN_MAX_STEM: usize = 25;
const SUBDOMAIN_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Derive a host-label-safe subdomain from a display name: lowercase,
/// non-alphanumeric runs collapsed to single dashes, stem capped at 25
/// chars, plus a random 6-char suffix for uniqueness.
pub fn generate_subdomain(name: &str) -> String {
    let mut stem = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            stem.push(c);
            last_dash = false;
        } else if !last_dash {
            stem.push('-');
            last_dash = true;
        }
    }
    while stem.ends_with('-') {
        stem.pop();
    }
    stem.truncate(SUBDOMAIN_MAX_STEM);
    while stem.ends_with('-') {
        stem.pop();
    }

    let mut rng = rand::thread_rng();
    let suffix: String = (0..SUBDOMAIN_SUFFIX_LEN)
        .map(|_| SUBDOMAIN_CHARSET[rng.gen_range(0..SUBDOMAIN_CHARSET.len())] as char)
        .collect();

    if stem.is_empty() {
        suffix
    } else {
        format!("{}-{}", stem, suffix)
    }
}

/// Fixture shared by tests across the crate.
#[cfg(test)]
pub(crate) fn test_project() -> Project {
    Project {
        id: 1,
        owner_id: 7,
        name: "Blog".to_string(),
        source_url: "https://git.example/u/blog.git".to_string(),
        branch: "main".to_string(),
        subdomain: "blog-abc123".to_string(),
        database_name: "blog".to_string(),
        status: ProjectStatus::Pending,
        container_id: None,
        runtime_version: None,
        framework_version: None,
        manual_runtime_version: false,
        queue_worker_enabled: false,
        error_log: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        deleted_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            ProjectStatus::Pending,
            ProjectStatus::Building,
            ProjectStatus::Running,
            ProjectStatus::Failed,
            ProjectStatus::Stopped,
        ] {
            assert_eq!(status.as_str().parse::<ProjectStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<ProjectStatus>().is_err());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ProjectStatus::Building).unwrap(),
            "\"building\""
        );
    }

    #[test]
    fn subdomain_is_host_label_safe() {
        let sub = generate_subdomain("My Blog!");
        assert!(sub.starts_with("my-blog-"));
        assert!(sub.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert_eq!(sub.len(), "my-blog-".len() + SUBDOMAIN_SUFFIX_LEN);
    }

    #[test]
    fn subdomain_collapses_symbol_runs() {
        let sub = generate_subdomain("a +++ b");
        assert!(sub.starts_with("a-b-"));
    }

    #[test]
    fn subdomain_stem_is_capped() {
        let sub = generate_subdomain(&"x".repeat(80));
        // stem (25) + dash + suffix (6)
        assert_eq!(sub.len(), SUBDOMAIN_MAX_STEM + 1 + SUBDOMAIN_SUFFIX_LEN);
    }

    #[test]
    fn subdomain_from_symbols_only_is_just_the_suffix() {
        let sub = generate_subdomain("!!!");
        assert_eq!(sub.len(), SUBDOMAIN_SUFFIX_LEN);
    }

    #[test]
    fn subdomains_are_randomized() {
        assert_ne!(generate_subdomain("app"), generate_subdomain("app"));
    }

    #[test]
    fn full_domain_and_image_tag() {
        let project = test_project();
        assert_eq!(project.full_domain("p.example.edu"), "blog-abc123.p.example.edu");
        assert_eq!(project.image_tag(), "paas-blog-abc123");
    }
}
