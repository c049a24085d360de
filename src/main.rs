//! Playground gateway: serves the page catalog and drives one Docker sandbox
//! per open page instance.
//!
//! Usage:
//!   playground --catalog pages.json [--port 8080]

use clap::Parser;
use playground::catalog::Catalog;
use playground::config::Config;
use playground::http_server;
use playground::registry::SessionRegistry;
use playground::sandbox::DockerExecutor;
use playground::state::AppState;
use std::process::exit;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Config::parse();

    let filter = EnvFilter::try_new(&config.log).unwrap_or_else(|e| {
        eprintln!("Error: invalid log filter {:?}: {}", config.log, e);
        exit(1);
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let catalog = match Catalog::load(&config.catalog) {
        Ok(catalog) => Arc::new(catalog),
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(1);
        }
    };
    info!(
        pages = catalog.len(),
        catalog = %config.catalog.display(),
        "Loaded page catalog"
    );

    let executor = Arc::new(DockerExecutor::new(config.docker.clone()));
    let registry = Arc::new(SessionRegistry::new(
        catalog,
        executor,
        config.registry_config(),
    ));

    if let Err(e) = http_server::run_server(config.port, AppState::new(registry)).await {
        eprintln!("Error: {}", e);
        exit(1);
    }
}
