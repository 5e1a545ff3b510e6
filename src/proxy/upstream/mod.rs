// Upstream clients, one per configured endpoint

pub mod body;
pub mod client;

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Duration;

use crate::error::{AppError, AppResult};
use crate::proxy::config::ProxyConfig;
use crate::proxy::token_manager::TokenManager;
use crate::utils::http::create_client_with_proxy;

pub use body::{MultipartPayload, OutboundBody};
pub use client::{AuthenticatedClient, UpstreamError};

/// Named upstream clients plus the default used when no selector matches.
pub struct ClientRegistry {
    clients: BTreeMap<String, Arc<AuthenticatedClient>>,
    default: Arc<AuthenticatedClient>,
}

impl ClientRegistry {
    pub fn from_config(config: &ProxyConfig, token_manager: Arc<TokenManager>) -> AppResult<Self> {
        let timeout = Duration::from_millis(config.request_timeout_ms);
        let mut clients = BTreeMap::new();

        for (name, upstream) in &config.upstreams {
            let http = create_client_with_proxy(timeout, Some(&config.upstream_proxy))?;
            let client = AuthenticatedClient::new(
                name,
                upstream,
                http,
                token_manager.clone(),
                timeout,
                config.max_retries,
            )
            .map_err(|e| AppError::Config(format!("upstream '{}': {}", name, e)))?;
            tracing::debug!(endpoint = %name, tenant = %upstream.tenant, base_url = %upstream.base_url, "Upstream client ready");
            clients.insert(name.clone(), Arc::new(client));
        }

        let default = clients.get(&config.default_upstream).cloned().ok_or_else(|| {
            AppError::Config(format!(
                "default upstream '{}' is not configured",
                config.default_upstream
            ))
        })?;

        Ok(Self { clients, default })
    }

    /// Client for `selector`. Absent, blank and unknown selectors get the default client.
    pub fn select(&self, selector: Option<&str>) -> Arc<AuthenticatedClient> {
        let Some(name) = selector.map(str::trim).filter(|s| !s.is_empty()) else {
            return self.default.clone();
        };
        match self.clients.get(name) {
            Some(client) => client.clone(),
            None => {
                tracing::warn!(
                    selector = %name,
                    default = %self.default.name(),
                    configured = %self.names().join(", "),
                    "Unknown endpoint selector, using default upstream"
                );
                self.default.clone()
            }
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.clients.keys().map(String::as_str).collect()
    }
}
