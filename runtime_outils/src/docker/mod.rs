//! Container runtime driver.
//!
//! Thin wrappers over the `docker` CLI for everything the control plane does
//! to the runtime: building project images, running and retiring containers,
//! health inspection, logs, resource stats and artisan execution. Commands
//! are always argv arrays; output is captured and stderr travels inside the
//! error so pipeline failures carry the real cause.

mod commands;
mod stats;

pub use stats::ContainerStats;

use tokio::process::Command;

/// Label applied to every project image so pruning can be scoped to us.
pub const PROJECT_LABEL: &str = "com.paas.project=true";

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    ProcessFailed {
        exit_code: Option<i32>,
        stderr: String,
    },
    BuildFailed(String),
    StatsUnavailable(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::ProcessFailed { exit_code, stderr } => {
                write!(f, "docker failed with exit code {:?}: {}", exit_code, stderr)
            }
            Error::BuildFailed(output) => write!(f, "docker build failed: {}", output),
            Error::StatsUnavailable(msg) => write!(f, "docker stats failed: {}", msg),
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

pub type Result<T> = std::result::Result<T, Error>;

/// Everything needed to start one project container.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub labels: Vec<String>,
}

/// Handle to the host's container runtime.
///
/// Holds the name of the reverse-proxy network every project container is
/// attached to. Cloning is cheap; the handle carries no connection state.
#[derive(Debug, Clone)]
pub struct DockerCli {
    network: String,
}

impl DockerCli {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }
}

/// Run a docker invocation, mapping non-zero exit to `ProcessFailed`.
async fn run(mut command: Command) -> Result<std::process::Output> {
    let output = command.output().await?;
    if !output.status.success() {
        return Err(Error::ProcessFailed {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}
