//! contact-sync daemon — loads configuration, opens the store, wires the
//! directory/CRM clients, starts the pending-queue worker, and serves the
//! HTTP surface.

use anyhow::{Context, Result};
use csync_core::config::Config;
use csync_crm::{EnvCredentials, SourceCrmClient};
use csync_directory::DirectoryClient;
use csync_store::SqliteStore;
use csync_worker::PendingQueueWorker;
use std::sync::Arc;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    csync_telemetry::logging::init_logging("csync-daemon", "info");

    let config = Config::from_env().context("invalid configuration")?;
    info!(
        db_path = %config.db_path,
        directory_rpm = config.directory_rpm,
        "csync-daemon starting"
    );

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open store at {}", config.db_path))?,
    );

    let credentials: Box<dyn csync_crm::CrmCredentials> = match config.source_crm_auth_mode {
        csync_core::config::SourceCrmAuthMode::Llt => Box::new(EnvCredentials::llt()),
        csync_core::config::SourceCrmAuthMode::ApiKey => Box::new(EnvCredentials::api_key()),
    };
    let crm = Arc::new(SourceCrmClient::new(config.source_crm_base_url.clone(), credentials));

    let directory = Arc::new(DirectoryClient::new(
        "https://people.googleapis.com/v1",
        reqwest::Client::new(),
        config.directory_rpm as usize,
    ));

    let worker = Arc::new(PendingQueueWorker::new(
        store.clone(),
        crm.clone(),
        directory.clone(),
        config.directory_group_name.clone(),
        config.auto_merge_duplicates,
        config.queue_batch_size,
    ));
    worker.start().await;

    let state = Arc::new(csync_api::state::AppState::new(
        store,
        crm,
        directory,
        worker.clone(),
        config.clone(),
    ));
    let app = csync_api::router(state);

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "http server listening");

    let shutdown_worker = worker.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, shutting down");
        shutdown_worker.stop().await;
        std::process::exit(0);
    });

    axum::serve(listener, app).await.context("http server failed")?;
    Ok(())
}
