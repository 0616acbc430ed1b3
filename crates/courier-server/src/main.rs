use anyhow::Result;
use tracing::info;

mod auth;
mod config;
mod server;
mod telemetry;

use config::ServerConfig;
use telemetry::LogFormat;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init(LogFormat::from_env())
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    info!("Courier Server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("License: AGPL-3.0");

    let config = ServerConfig::from_env()?;
    config.log_config();

    server::start(config).await?;

    telemetry::shutdown();
    Ok(())
}
