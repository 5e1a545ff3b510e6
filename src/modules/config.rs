use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{AppError, AppResult};
use crate::models::AppConfig;
use crate::proxy::config::ProxyConfig;

/// Environment variable naming an optional JSON config file
pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG";

const DATA_DIR: &str = ".health_api_gateway";

/// `~/.health_api_gateway`, not created here.
pub fn get_data_dir() -> AppResult<PathBuf> {
    Ok(dirs::home_dir()
        .ok_or_else(|| AppError::Config("Failed to get home directory".to_string()))?
        .join(DATA_DIR))
}

/// Load application config: optional JSON file, then environment overrides,
/// then validation.
pub fn load_app_config() -> AppResult<AppConfig> {
    let mut config = match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) if !path.trim().is_empty() => read_config_file(Path::new(path.trim()))?,
        _ => AppConfig::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.proxy.validate().map_err(AppError::Config)?;
    Ok(config)
}

pub fn read_config_file(path: &Path) -> AppResult<AppConfig> {
    let content = fs::read_to_string(path).map_err(|e| {
        AppError::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        AppError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Apply deployment environment variables on top of `config`.
/// Blank values are ignored.
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| {
        lookup(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let proxy = &mut config.proxy;

    if let Some(port) = get("APP_PORT") {
        parse_into(&mut proxy.port, "APP_PORT", &port);
    }
    if let Some(flag) = get("ALLOW_LAN_ACCESS") {
        proxy.allow_lan_access = parse_bool(&flag);
    }
    if let Some(flag) = get("USE_API_KEY") {
        proxy.use_api_key = parse_bool(&flag);
    }
    if let Some(key) = get("API_KEY") {
        proxy.api_key = Some(key);
    }
    if let Some(path) = get("API_KEY_FILE") {
        proxy.api_key_file = Some(path.into());
    }
    if let Some(timeout) = get("HTTP_TIMEOUT_MS") {
        parse_into(&mut proxy.request_timeout_ms, "HTTP_TIMEOUT_MS", &timeout);
    }
    if let Some(code) = get("MOPH_HCODE") {
        proxy.hospital_code = code;
    }
    if let Some(suffix) = get("TOKEN_KEY") {
        proxy.token_key_suffix = suffix;
    }
    if let Some(suffix) = get("AUTH_PAYLOAD_KEY") {
        proxy.auth_payload_key_suffix = suffix;
    }

    if let Some(host) = get("REDIS_HOST") {
        proxy.cache.host = Some(host);
    }
    if let Some(port) = get("REDIS_PORT") {
        parse_into(&mut proxy.cache.port, "REDIS_PORT", &port);
    }
    if let Some(password) = get("REDIS_PASSWORD") {
        proxy.cache.password = Some(password);
    }

    for (var, tenant) in [("MOPH_IC_AUTH", "mophic"), ("FDH_AUTH", "fdh")] {
        if let Some(url) = get(var) {
            set_tenant(proxy, tenant, |t| t.auth_url = url);
        }
    }
    for (var, tenant) in [("MOPH_IC_AUTH_SECRET", "mophic"), ("FDH_AUTH_SECRET", "fdh")] {
        if let Some(secret) = get(var) {
            set_tenant(proxy, tenant, |t| t.secret = secret);
        }
    }

    for (var, upstream) in [
        ("MOPH_IC_API", "mophic"),
        ("EPIDEM_API", "epidem"),
        ("MOPH_PHR_API", "phr"),
        ("MOPH_CLAIM_API", "claim"),
        ("FDH_API", "fdh"),
    ] {
        if let Some(url) = get(var) {
            match proxy.upstreams.get_mut(upstream) {
                Some(target) => target.base_url = url,
                None => tracing::warn!("{} is set but upstream '{}' is not configured", var, upstream),
            }
        }
    }

    if let Some(level) = get("LOG_LEVEL") {
        config.log.level = level;
    }
    if let Some(dir) = get("LOG_DIR") {
        config.log.dir = Some(dir.into());
    }
}

fn set_tenant<F>(proxy: &mut ProxyConfig, tenant: &str, update: F)
where
    F: FnOnce(&mut crate::proxy::config::TenantConfig),
{
    match proxy.tenants.get_mut(tenant) {
        Some(t) => update(t),
        None => tracing::warn!("Tenant '{}' is not configured, override ignored", tenant),
    }
}

fn parse_into<T: FromStr>(target: &mut T, key: &str, value: &str) {
    match value.parse::<T>() {
        Ok(parsed) => *target = parsed,
        Err(_) => tracing::warn!("Ignoring invalid {}: {}", key, value),
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "y"
    )
}
