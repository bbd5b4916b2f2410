//! TierDB Server - HTTP API over the tiered telemetry store

mod api;

use anyhow::Context;
use std::net::SocketAddr;
use std::path::PathBuf;
use tierdb_core::{TelemetryStore, TierConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:8086";

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Store settings file
    pub config_path: Option<PathBuf>,
}

impl ServerConfig {
    /// First CLI argument or `TIERDB_CONFIG` for the settings file,
    /// `TIERDB_ADDR` for the listen address
    fn from_env() -> anyhow::Result<Self> {
        let config_path = std::env::args()
            .nth(1)
            .or_else(|| std::env::var("TIERDB_CONFIG").ok())
            .map(PathBuf::from);
        let addr = std::env::var("TIERDB_ADDR").unwrap_or_else(|_| DEFAULT_HTTP_ADDR.to_string());
        let http_addr = addr
            .parse()
            .with_context(|| format!("invalid listen address {addr}"))?;
        Ok(Self {
            http_addr,
            config_path,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServerConfig::from_env()?;
    let settings = match &config.config_path {
        Some(path) => TierConfig::load(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => TierConfig::default(),
    };

    info!("Starting TierDB server...");
    match &settings.data_dir {
        Some(dir) => info!("Data directory: {:?}", dir),
        None => info!("No data directory configured, store is in-memory"),
    }

    let store = TelemetryStore::open(&settings).context("failed to open store")?;
    let app = api::create_router(store);

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("TierDB server listening on http://{}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    Ok(())
}
