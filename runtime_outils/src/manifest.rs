//! Laravel manifest inspection.
//!
//! Reads `composer.json` from a cloned project and decides which framework
//! major and PHP runtime version the image should be built with. The policy
//! mirrors what the platform supports:
//! - framework major is taken from the `laravel/framework` constraint
//! - each supported framework major maps to a minimum PHP version
//! - only when the framework major is unknown is the `php` constraint parsed
//! - defaults are Laravel 11 on PHP 8.3

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

pub const DEFAULT_FRAMEWORK_MAJOR: &str = "11";
pub const DEFAULT_RUNTIME_VERSION: &str = "8.3";

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    ManifestInvalid(serde_json::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "failed to read composer.json: {}", err),
            Error::ManifestInvalid(err) => write!(f, "failed to parse composer.json: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::ManifestInvalid(err) => Some(err),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ManifestInvalid(err)
    }
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Deserialize)]
struct ComposerManifest {
    #[serde(default)]
    require: HashMap<String, String>,
}

/// Versions resolved from a project manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedVersions {
    pub framework_major: String,
    pub runtime_version: String,
}

/// Read `composer.json` under `project_path` and resolve versions.
pub async fn detect_versions(project_path: &Path) -> Result<DetectedVersions> {
    let data = tokio::fs::read(project_path.join("composer.json")).await?;
    let manifest: ComposerManifest = serde_json::from_slice(&data)?;

    let framework_major = manifest
        .require
        .get("laravel/framework")
        .and_then(|constraint| extract_major(constraint))
        .unwrap_or_else(|| DEFAULT_FRAMEWORK_MAJOR.to_string());

    let runtime_version = runtime_for_framework(
        &framework_major,
        manifest.require.get("php").map(String::as_str),
    );

    Ok(DetectedVersions {
        framework_major,
        runtime_version,
    })
}

/// Extract the major version from a constraint like `^11.0`, `~10.2`, `11.*`
/// or `>=9.0`. The major is the first digit run that is followed by a dot.
fn extract_major(constraint: &str) -> Option<String> {
    let bytes = constraint.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if bytes.get(i) == Some(&b'.') {
                return Some(constraint[start..i].to_string());
            }
        } else {
            i += 1;
        }
    }
    None
}

/// Map a framework major to the PHP version the platform builds it with.
/// Unknown majors fall back to the `php` constraint, then to the default.
fn runtime_for_framework(framework_major: &str, php_constraint: Option<&str>) -> String {
    match framework_major {
        "8" => "8.0".to_string(),
        "9" => "8.1".to_string(),
        "10" => "8.2".to_string(),
        "11" => "8.3".to_string(),
        _ => php_constraint
            .and_then(extract_major_minor)
            .unwrap_or_else(|| DEFAULT_RUNTIME_VERSION.to_string()),
    }
}

/// Extract a `major.minor` pair from a PHP constraint like `^8.2` or `>=8.1.0`.
fn extract_major_minor(constraint: &str) -> Option<String> {
    let bytes = constraint.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if bytes.get(i) == Some(&b'.') {
                i += 1;
                let minor_start = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if i > minor_start {
                    return Some(constraint[start..i].to_string());
                }
            }
        } else {
            i += 1;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_major_from_common_constraints() {
        assert_eq!(extract_major("^11.0"), Some("11".to_string()));
        assert_eq!(extract_major("~10.2"), Some("10".to_string()));
        assert_eq!(extract_major("9.*"), Some("9".to_string()));
        assert_eq!(extract_major(">=8.0 <9.0"), Some("8".to_string()));
    }

    #[test]
    fn major_requires_a_dot() {
        assert_eq!(extract_major("11"), None);
        assert_eq!(extract_major("dev-main"), None);
        assert_eq!(extract_major(""), None);
    }

    #[test]
    fn framework_majors_map_to_minimum_runtime() {
        assert_eq!(runtime_for_framework("8", None), "8.0");
        assert_eq!(runtime_for_framework("9", None), "8.1");
        assert_eq!(runtime_for_framework("10", None), "8.2");
        assert_eq!(runtime_for_framework("11", None), "8.3");
    }

    #[test]
    fn unknown_framework_falls_back_to_php_constraint() {
        assert_eq!(runtime_for_framework("12", Some("^8.2")), "8.2");
        assert_eq!(runtime_for_framework("12", Some(">=8.1.0")), "8.1");
        assert_eq!(runtime_for_framework("12", None), DEFAULT_RUNTIME_VERSION);
        assert_eq!(
            runtime_for_framework("12", Some("a string")),
            DEFAULT_RUNTIME_VERSION
        );
    }

    #[tokio::test]
    async fn detects_versions_from_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("composer.json"),
            r#"{"require": {"php": "^8.2", "laravel/framework": "^10.0"}}"#,
        )
        .unwrap();

        let versions = detect_versions(dir.path()).await.unwrap();
        assert_eq!(versions.framework_major, "10");
        assert_eq!(versions.runtime_version, "8.2");
    }

    #[tokio::test]
    async fn empty_require_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("composer.json"), r#"{}"#).unwrap();

        let versions = detect_versions(dir.path()).await.unwrap();
        assert_eq!(versions.framework_major, DEFAULT_FRAMEWORK_MAJOR);
        assert_eq!(versions.runtime_version, DEFAULT_RUNTIME_VERSION);
    }

    #[tokio::test]
    async fn invalid_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("composer.json"), "not json").unwrap();

        assert!(matches!(
            detect_versions(dir.path()).await,
            Err(Error::ManifestInvalid(_))
        ));
    }
}
