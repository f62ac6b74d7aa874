use std::sync::Arc;

use tracing::{info, warn};

use paas_service::assembler::Assembler;
use paas_service::backend::DockerBackend;
use paas_service::pipeline::Pipeline;
use paas_service::project_store::ProjectStore;
use paas_service::settings::{SettingsStore, KEY_BASE_DOMAIN, KEY_PROJECT_DOMAIN};
use paas_service::web::{self, AppState};
use paas_service::worker::{Coordinator, TaskRegistry};
use paas_service::{traefik, Config, Database, JobQueue};
use runtime_outils::docker::DockerCli;
use runtime_outils::mysql::MysqlAdmin;

#[derive(Debug)]
enum Error {
    Database(String),
    Queue(String),
    Network(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Database(msg) => write!(f, "Database error: {}", msg),
            Error::Queue(msg) => write!(f, "Queue store error: {}", msg),
            Error::Network(msg) => write!(f, "Network error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

type Result<T> = std::result::Result<T, Error>;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting PaaS control plane");

    let config = Arc::new(Config::from_env());

    let db = Database::connect(&config)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
    let store = ProjectStore::new(db.clone());
    let settings = SettingsStore::new(db.clone());
    settings
        .ensure_defaults(&config)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

    let queue = JobQueue::connect(&config.redis_url())
        .await
        .map_err(|e| Error::Queue(e.to_string()))?;

    let docker = DockerCli::new(&config.docker_network);
    let mysql = MysqlAdmin::new(db.pool().clone());
    let assembler = Assembler::new(&config);
    let tasks = TaskRegistry::new();

    let backend = Arc::new(DockerBackend::new(
        docker.clone(),
        mysql,
        assembler,
        settings.clone(),
        config.clone(),
    ));
    let pipeline = Arc::new(Pipeline::new(backend, store.clone(), tasks.clone()));

    // Re-render the proxy's file-provider config from persisted settings so
    // panel-changed domains survive restarts.
    {
        let base = settings.get_or(KEY_BASE_DOMAIN, &config.base_domain).await;
        let project = settings
            .get_or(KEY_PROJECT_DOMAIN, &config.project_domain)
            .await;
        if let Err(err) = traefik::render_dynamic_config(
            &config.traefik_dynamic_template,
            &config.traefik_dynamic_config,
            &base,
            &project,
        ) {
            warn!(%err, "Could not sync proxy dynamic config at startup");
        }
    }

    let coordinator = Coordinator::start(
        config.worker_count,
        queue.clone(),
        store.clone(),
        pipeline.clone(),
        tasks,
    );

    let state = AppState {
        config: config.clone(),
        store,
        settings,
        queue,
        docker,
        pipeline,
    };
    let app = web::routes().with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Network(e.to_string()))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Network(e.to_string()))?;

    info!("HTTP server stopped, draining deployment workers");
    coordinator.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "Failed to listen for shutdown signal");
    }
}
