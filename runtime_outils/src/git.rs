//! Git operations for project sources.
//!
//! Handles fetching a student's application source into the per-project
//! build directory:
//! - Shallow clone of a single branch
//! - Preservation of an existing `.env` across re-clones
//! - Validation that the result is actually a Laravel application

use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    CloneFailed(String),
    NotAFrameworkApp(PathBuf),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::CloneFailed(stderr) => write!(f, "git clone failed: {}", stderr),
            Error::NotAFrameworkApp(path) => write!(
                f,
                "not a valid Laravel project (missing artisan file): {}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Clone `source_url` at `branch` into `dest`, replacing whatever was there.
///
/// A `.env` already present in `dest` survives the re-clone: its bytes are
/// captured before the directory is wiped and written back verbatim after
/// the clone succeeds. The clone is rolled back if the tree is not a Laravel
/// application (no `artisan` entry point).
pub async fn clone_project(source_url: &str, branch: &str, dest: &Path) -> Result<PathBuf> {
    let env_path = dest.join(".env");
    let env_backup = tokio::fs::read(&env_path).await.ok();

    if let Err(err) = tokio::fs::remove_dir_all(dest).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            return Err(err.into());
        }
    }

    info!(source_url, branch, dest = %dest.display(), "Cloning project source");

    let output = Command::new("git")
        .arg("clone")
        .arg("--depth=1")
        .arg("-b")
        .arg(branch)
        .arg(source_url)
        .arg(dest)
        .output()
        .await?;

    if !output.status.success() {
        return Err(Error::CloneFailed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    if let Some(bytes) = env_backup {
        if let Err(err) = tokio::fs::write(&env_path, bytes).await {
            warn!(dest = %dest.display(), %err, "Failed to restore .env after clone");
        }
    }

    if !dest.join("artisan").exists() {
        let _ = tokio::fs::remove_dir_all(dest).await;
        return Err(Error::NotAFrameworkApp(dest.to_path_buf()));
    }

    Ok(dest.to_path_buf())
}
