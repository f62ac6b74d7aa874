//! Deployment Pipeline
//!
//! Drives one deployment through its ordered steps and reconciles the
//! outcome into the project record:
//!
//! ```text
//! Pending ──► Building ──► Running
//!                   └────► Failed
//! Running ──► Building (redeploy) ──► Running | Failed
//! ```
//!
//! Each run assembles the build context, ensures the tenant database,
//! builds the image, starts a fresh timestamp-named container next to the
//! old one, gates promotion on container health, and only then records the
//! new container and retires the old. The platform prefers leaking a
//! stopped container to serving an outage.
//!
//! External effects go through [`DeployBackend`] and record writes through
//! [`StatusStore`], so the whole state machine is exercisable in tests
//! without a container runtime or a database.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::assembler::AssembledContext;
use crate::models::Project;
use crate::project_store::ProjectStore;
use crate::traefik;
use crate::worker::TaskRegistry;
use runtime_outils::docker::RunSpec;

pub const HEALTH_GATE_ATTEMPTS: u32 = 30;
pub const HEALTH_GATE_INTERVAL: Duration = Duration::from_secs(2);
pub const RETIRE_GRACE: Duration = Duration::from_secs(5);
pub const MIGRATE_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct DeploymentError(pub String);

impl std::fmt::Display for DeploymentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DeploymentError {}

type Result<T> = std::result::Result<T, DeploymentError>;

/// Every external effect a deployment performs.
///
/// Errors are the human-readable messages that end up in the project's
/// error log; the pipeline adds the step prefix where the backend cannot
/// know it.
pub trait DeployBackend: Send + Sync + 'static {
    /// Materialize the build context (clone, detect versions, stage
    /// templates, synthesize `.env`). The returned error message is already
    /// step-prefixed since only the assembler knows which phase failed.
    fn assemble(
        &self,
        project: &Project,
    ) -> impl Future<Output = std::result::Result<AssembledContext, String>> + Send;

    fn create_database(
        &self,
        name: &str,
    ) -> impl Future<Output = std::result::Result<(), String>> + Send;

    fn build_image(
        &self,
        context: &Path,
        image_tag: &str,
    ) -> impl Future<Output = std::result::Result<(), String>> + Send;

    fn run_container(
        &self,
        spec: RunSpec,
    ) -> impl Future<Output = std::result::Result<String, String>> + Send;

    fn is_healthy(&self, container_id: &str) -> impl Future<Output = bool> + Send;

    /// Best-effort: used for retirement and rollback, must not fail the run.
    fn remove_container(&self, container_id: &str) -> impl Future<Output = ()> + Send;

    fn remove_image(&self, subdomain: &str) -> impl Future<Output = ()> + Send;

    fn prune_images(&self) -> impl Future<Output = ()> + Send;

    fn remove_build_dir(&self, subdomain: &str) -> impl Future<Output = ()> + Send;

    fn drop_database(&self, name: &str) -> impl Future<Output = ()> + Send;

    fn migrate(
        &self,
        container_id: &str,
    ) -> impl Future<Output = std::result::Result<String, String>> + Send;
}

/// The record writes a deployment makes against the system of record.
pub trait StatusStore: Send + Sync + 'static {
    fn begin_build(&self, id: i64) -> impl Future<Output = std::result::Result<(), String>> + Send;

    fn set_versions(
        &self,
        id: i64,
        framework: &str,
        runtime: &str,
    ) -> impl Future<Output = std::result::Result<(), String>> + Send;

    fn promote(
        &self,
        id: i64,
        container_id: &str,
    ) -> impl Future<Output = std::result::Result<(), String>> + Send;

    fn fail(
        &self,
        id: i64,
        message: &str,
    ) -> impl Future<Output = std::result::Result<(), String>> + Send;

    fn hard_delete(&self, id: i64) -> impl Future<Output = std::result::Result<(), String>> + Send;
}

impl StatusStore for ProjectStore {
    async fn begin_build(&self, id: i64) -> std::result::Result<(), String> {
        ProjectStore::begin_build(self, id)
            .await
            .map_err(|err| err.to_string())
    }

    async fn set_versions(
        &self,
        id: i64,
        framework: &str,
        runtime: &str,
    ) -> std::result::Result<(), String> {
        ProjectStore::set_versions(self, id, framework, runtime)
            .await
            .map_err(|err| err.to_string())
    }

    async fn promote(&self, id: i64, container_id: &str) -> std::result::Result<(), String> {
        ProjectStore::promote(self, id, container_id)
            .await
            .map_err(|err| err.to_string())
    }

    async fn fail(&self, id: i64, message: &str) -> std::result::Result<(), String> {
        ProjectStore::fail(self, id, message)
            .await
            .map_err(|err| err.to_string())
    }

    async fn hard_delete(&self, id: i64) -> std::result::Result<(), String> {
        ProjectStore::hard_delete(self, id)
            .await
            .map_err(|err| err.to_string())
    }
}

pub struct Pipeline<B, S> {
    backend: Arc<B>,
    store: S,
    tasks: TaskRegistry,
}

impl<B: DeployBackend, S: StatusStore> Pipeline<B, S> {
    pub fn new(backend: Arc<B>, store: S, tasks: TaskRegistry) -> Self {
        Self {
            backend,
            store,
            tasks,
        }
    }

    /// Run one deployment to completion. On any step failure the project is
    /// marked Failed with a step-prefixed message and the remainder is
    /// skipped; the previously promoted container (if any) keeps serving.
    pub async fn deploy(&self, project: &Project) -> Result<()> {
        info!(
            project_id = project.id,
            subdomain = %project.subdomain,
            "Deployment started"
        );

        // Captured before any mutation: this is the container that keeps
        // serving until the new one is promoted.
        let old_container_id = project.container_id.clone();

        self.store
            .begin_build(project.id)
            .await
            .map_err(DeploymentError)?;

        let context = match self.backend.assemble(project).await {
            Ok(context) => context,
            Err(message) => return self.fail(project.id, message).await,
        };

        if let Err(err) = self
            .store
            .set_versions(project.id, &context.framework_version, &context.runtime_version)
            .await
        {
            return self
                .fail(project.id, format!("Failed to persist detected versions: {}", err))
                .await;
        }

        if let Err(err) = self.backend.create_database(&project.database_name).await {
            return self
                .fail(project.id, format!("Failed to create database: {}", err))
                .await;
        }

        let image_tag = project.image_tag();
        let build_result = self.backend.build_image(&context.path, &image_tag).await;

        // Prune after every build attempt, off the critical path.
        {
            let backend = self.backend.clone();
            self.tasks.spawn("image-prune", async move {
                backend.prune_images().await;
            });
        }

        if let Err(err) = build_result {
            return self
                .fail(project.id, format!("Failed to build image: {}", err))
                .await;
        }

        // Timestamp suffix keeps the new container's name clear of the one
        // still running; the shared service label makes both back the same
        // proxy service during the cut-over.
        let deploy_ts = Utc::now().timestamp();
        let container_name = format!("paas-project-{}-{}", project.subdomain, deploy_ts);
        let labels = traefik::router_labels(&project.subdomain, &context.project_domain, deploy_ts);

        let new_container_id = match self
            .backend
            .run_container(RunSpec {
                name: container_name,
                image: image_tag,
                labels,
            })
            .await
        {
            Ok(id) => id,
            Err(err) => {
                return self
                    .fail(project.id, format!("Failed to start container: {}", err))
                    .await
            }
        };

        if !self.await_healthy(&new_container_id).await {
            self.backend.remove_container(&new_container_id).await;
            let window = u64::from(HEALTH_GATE_ATTEMPTS) * HEALTH_GATE_INTERVAL.as_secs();
            return self
                .fail(
                    project.id,
                    format!("Container failed health check within {} seconds", window),
                )
                .await;
        }

        if let Err(err) = self.store.promote(project.id, &new_container_id).await {
            // Healthy but unrecorded; retire it rather than leave a container
            // the record knows nothing about.
            self.backend.remove_container(&new_container_id).await;
            return self
                .fail(project.id, format!("Failed to record promotion: {}", err))
                .await;
        }

        if let Some(old_id) = old_container_id {
            let backend = self.backend.clone();
            self.tasks.spawn("retire-old-container", async move {
                tokio::time::sleep(RETIRE_GRACE).await;
                backend.remove_container(&old_id).await;
            });
        }

        {
            let backend = self.backend.clone();
            let container_id = new_container_id.clone();
            let project_id = project.id;
            self.tasks.spawn("post-deploy-migrate", async move {
                tokio::time::sleep(MIGRATE_DELAY).await;
                match backend.migrate(&container_id).await {
                    Ok(_) => info!(project_id, "Post-deploy migrations finished"),
                    Err(err) => warn!(project_id, %err, "Post-deploy migrations failed"),
                }
            });
        }

        info!(
            project_id = project.id,
            container_id = %new_container_id,
            "Deployment promoted"
        );
        Ok(())
    }

    /// Delete path. Synchronous teardown of everything the project owns,
    /// finishing with the hard delete that frees its uniqueness slots.
    pub async fn teardown(&self, project: &Project) -> Result<()> {
        info!(
            project_id = project.id,
            subdomain = %project.subdomain,
            "Tearing down project"
        );

        if let Some(container_id) = &project.container_id {
            self.backend.remove_container(container_id).await;
        }
        self.backend.remove_image(&project.subdomain).await;
        self.backend.prune_images().await;
        self.backend.remove_build_dir(&project.subdomain).await;
        self.backend.drop_database(&project.database_name).await;

        self.store
            .hard_delete(project.id)
            .await
            .map_err(|err| DeploymentError(format!("Failed to delete project record: {}", err)))?;
        Ok(())
    }

    async fn await_healthy(&self, container_id: &str) -> bool {
        for _ in 0..HEALTH_GATE_ATTEMPTS {
            tokio::time::sleep(HEALTH_GATE_INTERVAL).await;
            if self.backend.is_healthy(container_id).await {
                return true;
            }
        }
        false
    }

    async fn fail(&self, project_id: i64, message: String) -> Result<()> {
        error!(project_id, %message, "Deployment failed");
        if let Err(err) = self.store.fail(project_id, &message).await {
            error!(project_id, %err, "Failed to record deployment failure");
        }
        Err(DeploymentError(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_project;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Shared call/event log so ordering across backend and store can be
    /// asserted in one place.
    #[derive(Clone, Default)]
    struct Log(Arc<Mutex<Vec<String>>>);

    impl Log {
        fn push(&self, entry: impl Into<String>) {
            self.0.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }

        fn position(&self, entry: &str) -> Option<usize> {
            self.entries().iter().position(|e| e == entry)
        }
    }

    /// Which steps should fail. Everything succeeds by default.
    #[derive(Default)]
    struct MockBehavior {
        assemble_error: Option<String>,
        create_database_error: Option<String>,
        build_error: Option<String>,
        run_error: Option<String>,
        healthy: bool,
    }

    struct MockBackend {
        behavior: MockBehavior,
        log: Log,
    }

    impl DeployBackend for MockBackend {
        async fn assemble(&self, _project: &Project) -> std::result::Result<AssembledContext, String> {
            self.log.push("assemble");
            if let Some(message) = &self.behavior.assemble_error {
                return Err(message.clone());
            }
            Ok(AssembledContext {
                path: PathBuf::from("/tmp/ctx"),
                framework_version: "11".to_string(),
                runtime_version: "8.3".to_string(),
                project_domain: "p.test".to_string(),
            })
        }

        async fn create_database(&self, name: &str) -> std::result::Result<(), String> {
            self.log.push(format!("create_database:{}", name));
            match &self.behavior.create_database_error {
                Some(message) => Err(message.clone()),
                None => Ok(()),
            }
        }

        async fn build_image(
            &self,
            _context: &Path,
            image_tag: &str,
        ) -> std::result::Result<(), String> {
            self.log.push(format!("build_image:{}", image_tag));
            match &self.behavior.build_error {
                Some(message) => Err(message.clone()),
                None => Ok(()),
            }
        }

        async fn run_container(&self, spec: RunSpec) -> std::result::Result<String, String> {
            assert!(spec.name.starts_with("paas-project-"));
            assert_eq!(spec.labels.len(), 6);
            self.log.push(format!("run_container:{}", spec.image));
            match &self.behavior.run_error {
                Some(message) => Err(message.clone()),
                None => Ok("container-new".to_string()),
            }
        }

        async fn is_healthy(&self, _container_id: &str) -> bool {
            self.log.push("is_healthy");
            self.behavior.healthy
        }

        async fn remove_container(&self, container_id: &str) {
            self.log.push(format!("remove_container:{}", container_id));
        }

        async fn remove_image(&self, subdomain: &str) {
            self.log.push(format!("remove_image:{}", subdomain));
        }

        async fn prune_images(&self) {
            self.log.push("prune_images");
        }

        async fn remove_build_dir(&self, subdomain: &str) {
            self.log.push(format!("remove_build_dir:{}", subdomain));
        }

        async fn drop_database(&self, name: &str) {
            self.log.push(format!("drop_database:{}", name));
        }

        async fn migrate(&self, container_id: &str) -> std::result::Result<String, String> {
            self.log.push(format!("migrate:{}", container_id));
            Ok(String::new())
        }
    }

    #[derive(Clone)]
    struct MockStore {
        log: Log,
    }

    impl StatusStore for MockStore {
        async fn begin_build(&self, _id: i64) -> std::result::Result<(), String> {
            self.log.push("begin_build");
            Ok(())
        }

        async fn set_versions(
            &self,
            _id: i64,
            framework: &str,
            runtime: &str,
        ) -> std::result::Result<(), String> {
            self.log.push(format!("set_versions:{}:{}", framework, runtime));
            Ok(())
        }

        async fn promote(&self, _id: i64, container_id: &str) -> std::result::Result<(), String> {
            self.log.push(format!("promote:{}", container_id));
            Ok(())
        }

        async fn fail(&self, _id: i64, message: &str) -> std::result::Result<(), String> {
            self.log.push(format!("fail:{}", message));
            Ok(())
        }

        async fn hard_delete(&self, _id: i64) -> std::result::Result<(), String> {
            self.log.push("hard_delete");
            Ok(())
        }
    }

    fn pipeline_with(
        behavior: MockBehavior,
    ) -> (Pipeline<MockBackend, MockStore>, Log, TaskRegistry) {
        let log = Log::default();
        let backend = Arc::new(MockBackend {
            behavior,
            log: log.clone(),
        });
        let store = MockStore { log: log.clone() };
        let tasks = TaskRegistry::new();
        (Pipeline::new(backend, store, tasks.clone()), log, tasks)
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_promotes_then_retires_the_old_container() {
        let (pipeline, log, tasks) = pipeline_with(MockBehavior {
            healthy: true,
            ..Default::default()
        });
        let mut project = test_project();
        project.container_id = Some("container-old".to_string());

        pipeline.deploy(&project).await.unwrap();
        tasks.join_all().await;

        let entries = log.entries();
        assert!(entries.contains(&"begin_build".to_string()));
        assert!(entries.contains(&"set_versions:11:8.3".to_string()));
        assert!(entries.contains(&"create_database:blog".to_string()));
        assert!(entries.contains(&"build_image:paas-blog-abc123".to_string()));
        assert!(entries.contains(&"promote:container-new".to_string()));
        assert!(entries.contains(&"prune_images".to_string()));
        assert!(entries.contains(&"migrate:container-new".to_string()));

        // The old container goes away only after the new one is promoted.
        let promoted = log.position("promote:container-new").unwrap();
        let retired = log.position("remove_container:container-old").unwrap();
        assert!(promoted < retired);
    }

    #[tokio::test(start_paused = true)]
    async fn first_deploy_has_nothing_to_retire() {
        let (pipeline, log, tasks) = pipeline_with(MockBehavior {
            healthy: true,
            ..Default::default()
        });
        let project = test_project();

        pipeline.deploy(&project).await.unwrap();
        tasks.join_all().await;

        assert!(log
            .entries()
            .iter()
            .all(|entry| !entry.starts_with("remove_container:")));
    }

    #[tokio::test(start_paused = true)]
    async fn assemble_failure_records_the_message_verbatim() {
        let (pipeline, log, _tasks) = pipeline_with(MockBehavior {
            assemble_error: Some("Failed to clone repository: no such branch".to_string()),
            ..Default::default()
        });

        let err = pipeline.deploy(&test_project()).await.unwrap_err();
        assert_eq!(err.0, "Failed to clone repository: no such branch");

        let entries = log.entries();
        assert!(entries.contains(&"fail:Failed to clone repository: no such branch".to_string()));
        assert!(!entries.iter().any(|e| e.starts_with("create_database:")));
    }

    #[tokio::test(start_paused = true)]
    async fn database_failure_is_step_prefixed() {
        let (pipeline, log, _tasks) = pipeline_with(MockBehavior {
            create_database_error: Some("access denied".to_string()),
            ..Default::default()
        });

        let err = pipeline.deploy(&test_project()).await.unwrap_err();
        assert_eq!(err.0, "Failed to create database: access denied");
        assert!(!log.entries().iter().any(|e| e.starts_with("build_image:")));
    }

    #[tokio::test(start_paused = true)]
    async fn build_failure_still_prunes_and_never_runs() {
        let (pipeline, log, tasks) = pipeline_with(MockBehavior {
            build_error: Some("compile error".to_string()),
            ..Default::default()
        });

        let err = pipeline.deploy(&test_project()).await.unwrap_err();
        assert_eq!(err.0, "Failed to build image: compile error");

        tasks.join_all().await;
        let entries = log.entries();
        assert!(entries.contains(&"prune_images".to_string()));
        assert!(!entries.iter().any(|e| e.starts_with("run_container:")));
    }

    #[tokio::test(start_paused = true)]
    async fn run_failure_leaves_no_container_to_clean_up() {
        let (pipeline, log, tasks) = pipeline_with(MockBehavior {
            run_error: Some("port exhausted".to_string()),
            ..Default::default()
        });
        let mut project = test_project();
        project.container_id = Some("container-old".to_string());

        let err = pipeline.deploy(&project).await.unwrap_err();
        assert_eq!(err.0, "Failed to start container: port exhausted");

        tasks.join_all().await;
        // Neither the (nonexistent) new container nor the still-serving old
        // one gets removed.
        assert!(log
            .entries()
            .iter()
            .all(|entry| !entry.starts_with("remove_container:")));
    }

    #[tokio::test(start_paused = true)]
    async fn health_gate_timeout_removes_the_new_container() {
        let (pipeline, log, tasks) = pipeline_with(MockBehavior {
            healthy: false,
            ..Default::default()
        });
        let mut project = test_project();
        project.container_id = Some("container-old".to_string());

        let err = pipeline.deploy(&project).await.unwrap_err();
        assert!(err.0.starts_with("Container failed health check"));

        tasks.join_all().await;
        let entries = log.entries();
        assert_eq!(
            entries
                .iter()
                .filter(|e| *e == "is_healthy")
                .count() as u32,
            HEALTH_GATE_ATTEMPTS
        );
        assert!(entries.contains(&"remove_container:container-new".to_string()));
        // No promotion, and the old container keeps serving.
        assert!(!entries.iter().any(|e| e.starts_with("promote:")));
        assert!(!entries.contains(&"remove_container:container-old".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_releases_everything_in_order() {
        let (pipeline, log, _tasks) = pipeline_with(MockBehavior::default());
        let mut project = test_project();
        project.container_id = Some("container-old".to_string());

        pipeline.teardown(&project).await.unwrap();

        let entries = log.entries();
        let expected = [
            "remove_container:container-old",
            "remove_image:blog-abc123",
            "prune_images",
            "remove_build_dir:blog-abc123",
            "drop_database:blog",
            "hard_delete",
        ];
        let positions: Vec<usize> = expected
            .iter()
            .map(|entry| log.position(entry).unwrap_or_else(|| panic!("missing {entry}: {entries:?}")))
            .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    }
}
