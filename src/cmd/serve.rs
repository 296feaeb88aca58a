//! HTTP server command: `synth-runner serve`.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use synth_runner::server::{ServerConfig, start_server};

pub async fn cmd_serve(config_path: &Path, host: &str, port: u16) -> Result<()> {
    let runner = Arc::new(super::open_runner(config_path)?);
    start_server(
        runner,
        ServerConfig {
            host: host.to_string(),
            port,
        },
    )
    .await
}
