use crate::proxy::config::UpstreamProxyConfig;
use reqwest::{redirect, Client, Proxy};
use std::time::Duration;

/// Create an HTTP client with the given timeout and optional outbound proxy.
/// Redirects are never followed; upstream redirects are relayed to the caller.
pub fn create_client_with_proxy(
    timeout: Duration,
    proxy_config: Option<&UpstreamProxyConfig>,
) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .timeout(timeout)
        .redirect(redirect::Policy::none())
        .pool_idle_timeout(Duration::from_secs(90));

    if let Some(config) = proxy_config {
        if config.enabled && !config.url.is_empty() {
            match Proxy::all(&config.url) {
                Ok(proxy) => {
                    builder = builder.proxy(proxy);
                    tracing::info!("HTTP client upstream proxy enabled: {}", config.url);
                }
                Err(e) => {
                    tracing::error!("Invalid proxy address: {}, error: {}", config.url, e);
                }
            }
        }
    }

    builder.build()
}
