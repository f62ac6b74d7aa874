//! Image and container lifecycle commands.

use tokio::process::Command;
use tracing::{info, warn};

use super::{run, DockerCli, Error, Result, RunSpec, PROJECT_LABEL};

impl DockerCli {
    /// Build the project image from `context`, tagging it `image_tag`.
    ///
    /// Tries the buildx backend first (`--load` so the image lands in the
    /// local store), then falls back to the classic builder for hosts
    /// without buildx. On a double failure the error carries the combined
    /// stdout and stderr of the fallback attempt.
    pub async fn build_image(&self, context: &std::path::Path, image_tag: &str) -> Result<()> {
        let mut buildx = Command::new("docker");
        buildx
            .arg("buildx")
            .arg("build")
            .arg("--load")
            .arg("--label")
            .arg(PROJECT_LABEL)
            .arg("-t")
            .arg(image_tag)
            .arg(context);

        if run(buildx).await.is_ok() {
            return Ok(());
        }

        let mut classic = Command::new("docker");
        classic
            .arg("build")
            .arg("--label")
            .arg(PROJECT_LABEL)
            .arg("-t")
            .arg(image_tag)
            .arg(context);

        let output = classic.output().await?;
        if !output.status.success() {
            return Err(Error::BuildFailed(format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    /// Start a detached container on the proxy network and return its id.
    ///
    /// Resource caps and the restart policy are fixed platform-wide:
    /// half a CPU, 512 MiB, `unless-stopped`.
    pub async fn run_container(&self, spec: &RunSpec) -> Result<String> {
        let mut command = Command::new("docker");
        command
            .arg("run")
            .arg("-d")
            .arg("--name")
            .arg(&spec.name)
            .arg("--network")
            .arg(&self.network)
            .arg("--restart")
            .arg("unless-stopped")
            .arg("--cpus")
            .arg("0.5")
            .arg("--memory")
            .arg("512m");

        for label in &spec.labels {
            command.arg("--label").arg(label);
        }
        command.arg(&spec.image);

        let output = run(command).await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub async fn stop(&self, container_id: &str) -> Result<()> {
        let mut command = Command::new("docker");
        command.arg("stop").arg(container_id);
        run(command).await?;
        Ok(())
    }

    /// Best-effort stop + rm. A container that is already gone is fine.
    pub async fn remove(&self, container_id: &str) {
        if let Err(err) = self.stop(container_id).await {
            warn!(container_id, %err, "docker stop failed");
        }

        let mut rm = Command::new("docker");
        rm.arg("rm").arg(container_id);
        if let Err(err) = run(rm).await {
            warn!(container_id, %err, "docker rm failed");
        }
    }

    /// Remove a project's image. Best-effort.
    pub async fn remove_image(&self, subdomain: &str) {
        let mut command = Command::new("docker");
        command.arg("rmi").arg(format!("paas-{}", subdomain));
        if let Err(err) = run(command).await {
            warn!(subdomain, %err, "docker rmi failed");
        }
    }

    /// Prune dangling images, then unused images carrying the project label.
    pub async fn prune_images(&self) {
        let mut dangling = Command::new("docker");
        dangling.arg("image").arg("prune").arg("-f");
        if let Err(err) = run(dangling).await {
            warn!(%err, "dangling image prune failed");
        }

        let mut unused = Command::new("docker");
        unused
            .arg("image")
            .arg("prune")
            .arg("-a")
            .arg("-f")
            .arg("--filter")
            .arg(format!("label={}", PROJECT_LABEL));
        if let Err(err) = run(unused).await {
            warn!(%err, "project image prune failed");
        }

        info!("Image prune finished");
    }

    /// True when the container reports `healthy` or `starting`, or, for
    /// containers without a health probe, when it is running at all.
    pub async fn is_healthy(&self, container_id: &str) -> bool {
        let mut inspect = Command::new("docker");
        inspect
            .arg("inspect")
            .arg("--format")
            .arg("{{.State.Health.Status}}")
            .arg(container_id);

        if let Ok(output) = run(inspect).await {
            let status = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if status == "healthy" || status == "starting" {
                return true;
            }
            if status == "unhealthy" {
                return false;
            }
        }

        let mut running = Command::new("docker");
        running
            .arg("inspect")
            .arg("--format")
            .arg("{{.State.Running}}")
            .arg(container_id);

        match run(running).await {
            Ok(output) => String::from_utf8_lossy(&output.stdout).trim() == "true",
            Err(_) => false,
        }
    }

    /// Fetch the last `tail_lines` of container output. Docker splits the
    /// application's streams, so stdout and stderr are concatenated.
    pub async fn logs(&self, container_id: &str, tail_lines: u32) -> Result<String> {
        let mut command = Command::new("docker");
        command
            .arg("logs")
            .arg("--tail")
            .arg(tail_lines.to_string())
            .arg(container_id);

        let output = run(command).await?;
        Ok(format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ))
    }

    /// Run `php artisan <args…>` inside the container.
    pub async fn exec_artisan(&self, container_id: &str, args: &[&str]) -> Result<String> {
        let mut command = Command::new("docker");
        command
            .arg("exec")
            .arg(container_id)
            .arg("php")
            .arg("artisan");
        for arg in args {
            command.arg(arg);
        }

        let output = command.output().await?;
        if !output.status.success() {
            return Err(Error::ProcessFailed {
                exit_code: output.status.code(),
                stderr: format!(
                    "{}\n{}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
