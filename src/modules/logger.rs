use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::AppResult;
use crate::models::LogConfig;
use crate::modules::config::get_data_dir;

pub fn get_log_dir(config: &LogConfig) -> AppResult<PathBuf> {
    let log_dir = match &config.dir {
        Some(dir) => dir.clone(),
        None => get_data_dir()?.join("logs"),
    };

    if !log_dir.exists() {
        fs::create_dir_all(&log_dir)?;
    }

    Ok(log_dir)
}

/// Initialize logger system
pub fn init_logger(config: &LogConfig) {
    // Capture log macro logs
    let _ = tracing_log::LogTracer::init();

    // RUST_LOG wins over the configured level
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = fmt::Layer::new()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true);

    let file_layer = match get_log_dir(config) {
        Ok(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "gateway.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            // Flushing guard lives until process exit
            std::mem::forget(guard);
            Some(
                fmt::Layer::new()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(true)
                    .with_level(true),
            )
        }
        Err(e) => {
            eprintln!("Failed to initialize log directory: {}", e);
            None
        }
    };

    // try_init so a second initialization is harmless
    let _ = tracing_subscriber::registry()
        .with(filter_layer)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    info!("Logger system initialized (Console + File Persistence)");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_log_dir_is_created() {
        let root = tempfile::tempdir().unwrap();
        let config = LogConfig {
            level: "debug".to_string(),
            dir: Some(root.path().join("nested").join("logs")),
        };
        let dir = get_log_dir(&config).unwrap();
        assert!(dir.is_dir());
        assert!(dir.ends_with("nested/logs"));
    }
}
