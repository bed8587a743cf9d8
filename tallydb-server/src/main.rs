//! TallyDB Server - HTTP API for the aggregation engine

mod api;
mod protocol;

use anyhow::Context;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tallydb_core::storage::{StorageConfig, StorageEngine};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Data directory
    pub data_dir: PathBuf,
    /// Period of the background sync
    pub sync_period: Duration,
    /// Acknowledge track batches only after a sync pass
    pub durable_acks: bool,
    /// Requested segment size for new databases
    pub segment_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            data_dir: PathBuf::from("data"),
            sync_period: Duration::from_millis(tallydb_core::config::SYNC_PERIOD_MS),
            durable_acks: true,
            segment_size: tallydb_core::config::SEGMENT_SIZE,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `TALLYDB_*` environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = var("TALLYDB_ADDR") {
            config.http_addr = addr
                .parse()
                .with_context(|| format!("invalid TALLYDB_ADDR {:?}", addr))?;
        }
        if let Some(dir) = var("TALLYDB_DATA") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(ms) = var("TALLYDB_SYNC_MS") {
            let ms: u64 = ms
                .parse()
                .with_context(|| format!("invalid TALLYDB_SYNC_MS {:?}", ms))?;
            anyhow::ensure!(ms > 0, "TALLYDB_SYNC_MS must be positive");
            config.sync_period = Duration::from_millis(ms);
        }
        if let Some(durable) = var("TALLYDB_DURABLE_ACKS") {
            config.durable_acks = durable
                .parse()
                .with_context(|| format!("invalid TALLYDB_DURABLE_ACKS {:?}", durable))?;
        }
        if let Some(size) = var("TALLYDB_SEGMENT_SIZE") {
            config.segment_size = size
                .parse()
                .with_context(|| format!("invalid TALLYDB_SEGMENT_SIZE {:?}", size))?;
        }

        Ok(config)
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
        .with_thread_ids(false)
        .init();

    let config = ServerConfig::from_env()?;

    info!("Starting TallyDB server...");
    info!("Data directory: {:?}", config.data_dir);
    info!("HTTP server: http://{}", config.http_addr);

    // Initialize storage engine
    let storage_config = StorageConfig {
        data_dir: config.data_dir.clone(),
        segment_size: config.segment_size,
        sync_period: config.sync_period,
    };

    let engine = StorageEngine::new(storage_config)?;
    let engine = Arc::new(engine);

    let syncer = tallydb_core::sync::spawn(engine.clone(), config.sync_period);
    let durable = config.durable_acks.then(|| syncer.waiter());

    // Create router
    let app = api::create_router(api::AppState::new(engine.clone(), durable));

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("TallyDB server listening on {}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Runs one last pass before returning
    syncer.shutdown().await;
    info!("TallyDB server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down...");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> anyhow::Result<ServerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.http_addr.port(), 8000);
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.sync_period, Duration::from_millis(100));
        assert!(config.durable_acks);
    }

    #[test]
    fn test_env_overrides() {
        let config = config_from(&[
            ("TALLYDB_ADDR", "127.0.0.1:9100"),
            ("TALLYDB_DATA", "/var/lib/tallydb"),
            ("TALLYDB_SYNC_MS", "250"),
            ("TALLYDB_DURABLE_ACKS", "false"),
            ("TALLYDB_SEGMENT_SIZE", "1048576"),
        ])
        .unwrap();

        assert_eq!(config.http_addr, "127.0.0.1:9100".parse::<SocketAddr>().unwrap());
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/tallydb"));
        assert_eq!(config.sync_period, Duration::from_millis(250));
        assert!(!config.durable_acks);
        assert_eq!(config.segment_size, 1 << 20);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(config_from(&[("TALLYDB_ADDR", "nowhere")]).is_err());
        assert!(config_from(&[("TALLYDB_SYNC_MS", "0")]).is_err());
        assert!(config_from(&[("TALLYDB_SYNC_MS", "-5")]).is_err());
        assert!(config_from(&[("TALLYDB_DURABLE_ACKS", "maybe")]).is_err());
    }
}
