mod commands;
pub mod error;
mod models;
mod modules;
pub mod proxy; // Gateway service module
mod utils;

use error::AppResult;
use models::LogConfig;
use tracing::{error, info};

/// Load configuration, start the gateway and serve until ctrl-c.
pub async fn run() -> AppResult<()> {
    let config = match modules::load_app_config() {
        Ok(config) => config,
        Err(e) => {
            modules::init_logger(&LogConfig::default());
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    // Initialize logger
    modules::init_logger(&config.log);

    let state = commands::proxy::ProxyServiceState::new();
    let status = commands::proxy::start_proxy_service(config.proxy, &state).await?;
    info!(
        port = status.port,
        cache = %status.cache_backend,
        tenants_ready = status.tenants_ready,
        "Gateway service started"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    commands::proxy::stop_proxy_service(&state).await
}
