use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::api::build_router;
use crate::runner::Runner;

/// Configuration for the HTTP server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Start the launcher worker and serve the HTTP API until Ctrl+C.
///
/// On shutdown the worker is stopped; a build already running keeps running
/// and is adopted by the next server instance.
pub async fn start_server(runner: Arc<Runner>, config: ServerConfig) -> Result<()> {
    let worker = runner.start_worker();
    let app = build_router(Arc::clone(&runner));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, queued = runner.queue_len(), "synthesis runner listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    if let Some(worker) = worker {
        worker.shutdown().await;
    }
    info!("server shut down gracefully");
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
