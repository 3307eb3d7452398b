//! Pagestore Server - HTTP API and admin control channel for the page store

mod api;
mod protocol;

use anyhow::Context;
use pagestore_core::storage::{StorageConfig, TenantRegistry};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Admin control channel listen address
    pub control_addr: SocketAddr,
    /// Emit logs as JSON lines
    pub log_json: bool,
    /// Storage engine settings
    pub storage: StorageConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 9898)),
            control_addr: SocketAddr::from(([127, 0, 0, 1], 6400)),
            log_json: false,
            storage: StorageConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Config file path from the first argument or `PAGESTORE_CONFIG`
    fn path_from_env() -> Option<PathBuf> {
        std::env::args_os()
            .nth(1)
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("PAGESTORE_CONFIG").map(PathBuf::from))
    }

    fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let data = std::fs::read(path).with_context(|| format!("reading config file {:?}", path))?;
        serde_json::from_slice(&data).with_context(|| format!("parsing config file {:?}", path))
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::load(ServerConfig::path_from_env().as_deref())?;
    init_logging(config.log_json);

    info!("Starting pagestore {}...", pagestore_core::VERSION);
    info!("Data directory: {:?}", config.storage.data_dir);

    let registry = TenantRegistry::new(config.storage.clone())
        .await
        .context("opening tenant registry")?;
    let shutdown = CancellationToken::new();

    let control_listener = tokio::net::TcpListener::bind(&config.control_addr).await?;
    info!("Control channel listening on {}", config.control_addr);
    let control = tokio::spawn(protocol::serve(control_listener, registry.clone(), shutdown.clone()));

    let app = api::create_router(registry.clone());
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("HTTP API listening on http://{}", config.http_addr);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down...");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    control.await?;
    registry.shutdown().await;
    Ok(())
}
