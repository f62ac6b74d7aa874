pub mod assembler;
pub mod auth;
pub mod backend;
pub mod config;
pub mod database;
pub mod models;
pub mod pipeline;
pub mod project_store;
pub mod queue;
pub mod settings;
pub mod traefik;
pub mod web;
pub mod worker;

pub use config::Config;
pub use database::Database;
pub use queue::JobQueue;
pub use web::AppState;
