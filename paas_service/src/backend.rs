//! Production deployment backend.
//!
//! Binds the pipeline's effect seam to the real world: the container
//! runtime CLI, the shared MySQL engine and the build-context assembler.

use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use crate::assembler::{AssembledContext, Assembler};
use crate::config::Config;
use crate::models::Project;
use crate::pipeline::DeployBackend;
use crate::settings::{SettingsStore, KEY_PROJECT_DOMAIN};
use runtime_outils::docker::{DockerCli, RunSpec};
use runtime_outils::mysql::MysqlAdmin;

pub struct DockerBackend {
    docker: DockerCli,
    mysql: MysqlAdmin,
    assembler: Assembler,
    settings: SettingsStore,
    config: Arc<Config>,
}

impl DockerBackend {
    pub fn new(
        docker: DockerCli,
        mysql: MysqlAdmin,
        assembler: Assembler,
        settings: SettingsStore,
        config: Arc<Config>,
    ) -> Self {
        Self {
            docker,
            mysql,
            assembler,
            settings,
            config,
        }
    }
}

impl DeployBackend for DockerBackend {
    async fn assemble(&self, project: &Project) -> Result<AssembledContext, String> {
        // Re-read the serving domain every run; admins may have changed it
        // since the last deployment.
        let project_domain = self
            .settings
            .get_or(KEY_PROJECT_DOMAIN, &self.config.project_domain)
            .await;

        self.assembler
            .assemble(project, &project_domain)
            .await
            .map_err(|err| err.to_string())
    }

    async fn create_database(&self, name: &str) -> Result<(), String> {
        self.mysql
            .create_database(name)
            .await
            .map_err(|err| err.to_string())
    }

    async fn build_image(&self, context: &Path, image_tag: &str) -> Result<(), String> {
        self.docker
            .build_image(context, image_tag)
            .await
            .map_err(|err| err.to_string())
    }

    async fn run_container(&self, spec: RunSpec) -> Result<String, String> {
        self.docker
            .run_container(&spec)
            .await
            .map_err(|err| err.to_string())
    }

    async fn is_healthy(&self, container_id: &str) -> bool {
        self.docker.is_healthy(container_id).await
    }

    async fn remove_container(&self, container_id: &str) {
        self.docker.remove(container_id).await;
    }

    async fn remove_image(&self, subdomain: &str) {
        self.docker.remove_image(subdomain).await;
    }

    async fn prune_images(&self) {
        self.docker.prune_images().await;
    }

    async fn remove_build_dir(&self, subdomain: &str) {
        let path = self.config.projects_root.join(subdomain);
        if let Err(err) = tokio::fs::remove_dir_all(&path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), %err, "Failed to remove build directory");
            }
        }
    }

    async fn drop_database(&self, name: &str) {
        self.mysql.drop_database(name).await;
    }

    async fn migrate(&self, container_id: &str) -> Result<String, String> {
        self.docker
            .exec_artisan(container_id, &["migrate", "--force"])
            .await
            .map_err(|err| err.to_string())
    }
}
