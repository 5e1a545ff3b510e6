use crate::error::{AppError, AppResult};
use crate::modules::keygen;
use crate::proxy::cache::{CacheBackendState, KeyValueCache};
use crate::proxy::server::AppState;
use crate::proxy::upstream::ClientRegistry;
use crate::proxy::{AxumServer, ProxyConfig, TokenManager};
use crate::utils::http::create_client_with_proxy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Gateway service status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyStatus {
    pub running: bool,
    pub port: u16,
    pub base_url: String,
    pub cache_backend: String,
    pub tenants_ready: usize,
}

/// Gateway service global state
#[derive(Default)]
pub struct ProxyServiceState {
    pub instance: Arc<RwLock<Option<ProxyServiceInstance>>>,
}

/// Gateway service instance
pub struct ProxyServiceInstance {
    pub config: ProxyConfig,
    pub cache: Arc<KeyValueCache>,
    pub token_manager: Arc<TokenManager>,
    pub axum_server: AxumServer,
    pub server_handle: tokio::task::JoinHandle<()>,
    pub tenants_ready: usize,
}

impl ProxyServiceState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Build the shared components, start listening and prefetch tokens.
pub async fn start_proxy_service(
    config: ProxyConfig,
    state: &ProxyServiceState,
) -> AppResult<ProxyStatus> {
    let mut instance_lock = state.instance.write().await;

    // Prevent duplicate start
    if instance_lock.is_some() {
        return Err(AppError::Server("Service is already running".to_string()));
    }

    // 1. Cache backend
    let cache = Arc::new(KeyValueCache::connect(&config.cache).await);

    // 2. Token manager
    let auth_client = create_client_with_proxy(
        Duration::from_millis(config.request_timeout_ms),
        Some(&config.upstream_proxy),
    )?;
    let token_manager = Arc::new(TokenManager::new(&config, cache.clone(), auth_client));

    // 3. Upstream clients
    let registry = Arc::new(ClientRegistry::from_config(&config, token_manager.clone())?);

    // 4. Axum server
    let app_state = AppState {
        registry,
        token_manager: token_manager.clone(),
        cache: cache.clone(),
        api_key: resolve_api_key(&config)?.map(Arc::from),
    };

    let (axum_server, server_handle) =
        AxumServer::start(config.get_bind_address(), config.port, app_state)
            .await
            .map_err(AppError::Server)?;

    // 5. Prefetch tokens from stored credentials
    let tenants_ready = token_manager.warm_tokens().await;

    let status = ProxyStatus {
        running: true,
        port: config.port,
        base_url: format!("http://127.0.0.1:{}", config.port),
        cache_backend: cache.backend_state().as_str().to_string(),
        tenants_ready,
    };

    *instance_lock = Some(ProxyServiceInstance {
        config,
        cache,
        token_manager,
        axum_server,
        server_handle,
        tenants_ready,
    });

    Ok(status)
}

/// Inbound key for the /api guard, `None` when the guard is disabled.
fn resolve_api_key(config: &ProxyConfig) -> AppResult<Option<String>> {
    if !config.use_api_key {
        tracing::warn!("API key guard is disabled (USE_API_KEY=false), /api is open to every caller");
        return Ok(None);
    }
    if let Some(key) = config.api_key.as_deref().filter(|k| !k.is_empty()) {
        tracing::info!("API key guard enabled with the configured key");
        return Ok(Some(key.to_string()));
    }

    let path = match &config.api_key_file {
        Some(path) => path.clone(),
        None => keygen::default_key_file()?,
    };
    let key = keygen::load_or_create(&path)?;
    tracing::info!("API key guard enabled, key file: {}", key.path().display());
    Ok(Some(key.as_str().to_string()))
}

/// Stop gateway service
pub async fn stop_proxy_service(state: &ProxyServiceState) -> AppResult<()> {
    let mut instance_lock = state.instance.write().await;

    let Some(instance) = instance_lock.take() else {
        return Err(AppError::Server("Service is not running".to_string()));
    };

    instance.axum_server.stop();
    // Wait for server task to complete
    instance.server_handle.await.ok();
    tracing::info!("Gateway service stopped");
    Ok(())
}

/// Get gateway service status
pub async fn get_proxy_status(state: &ProxyServiceState) -> ProxyStatus {
    let instance_lock = state.instance.read().await;

    match instance_lock.as_ref() {
        Some(instance) => ProxyStatus {
            running: true,
            port: instance.config.port,
            base_url: format!("http://127.0.0.1:{}", instance.config.port),
            cache_backend: instance.cache.backend_state().as_str().to_string(),
            tenants_ready: instance.tenants_ready,
        },
        None => ProxyStatus {
            running: false,
            port: 0,
            base_url: String::new(),
            cache_backend: CacheBackendState::Local.as_str().to_string(),
            tenants_ready: 0,
        },
    }
}
