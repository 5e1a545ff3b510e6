// Upstream client with bearer-token injection, transport retry and a single
// refresh-and-replay on authorization failures

use reqwest::{Client, Method, Response, StatusCode};
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Duration;
use url::Url;

use super::body::OutboundBody;
use crate::proxy::config::UpstreamConfig;
use crate::proxy::token_manager::{TokenManager, TokenRequest};

const BASE_BACKOFF_MS: u64 = 100;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("Cannot create token, please check the username and password configuration.")]
    TokenUnavailable { tenant: String },

    #[error("upstream request timeout")]
    Timeout {
        url: String,
        timeout_ms: u64,
        #[source]
        source: reqwest::Error,
    },

    #[error("upstream request failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("cannot prepare request body: {0}")]
    Body(#[from] std::io::Error),
}

pub struct AuthenticatedClient {
    name: String,
    base_url: Url,
    tenant: String,
    refresh_on: Vec<StatusCode>,
    http: Client,
    token_manager: Arc<TokenManager>,
    timeout: Duration,
    max_retries: u32,
}

impl AuthenticatedClient {
    pub fn new(
        name: &str,
        config: &UpstreamConfig,
        http: Client,
        token_manager: Arc<TokenManager>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, url::ParseError> {
        let refresh_on = config
            .refresh_on
            .iter()
            .filter_map(|code| StatusCode::from_u16(*code).ok())
            .collect();

        Ok(Self {
            name: name.to_string(),
            base_url: Url::parse(&config.base_url)?,
            tenant: config.tenant.clone(),
            refresh_on,
            http,
            token_manager,
            timeout,
            max_retries,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Resolve `path` (relative to the gateway mount point) against the base URL.
    pub fn url_for(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        let relative = path.trim_start_matches('/');
        if !relative.is_empty() {
            let joined = format!("{}/{}", url.path().trim_end_matches('/'), relative);
            url.set_path(&joined);
        }
        url.set_query(query.filter(|q| !q.is_empty()));
        url
    }

    /// Send a request with the tenant's bearer token.
    ///
    /// Any upstream status is returned as `Ok`. A status listed in
    /// `refresh_on` triggers one forced token refresh and one replay; the
    /// replay's response is returned whatever it is.
    pub async fn send(
        &self,
        method: Method,
        url: &Url,
        body: &OutboundBody,
    ) -> Result<Response, UpstreamError> {
        let token = self
            .token_manager
            .get_token(&self.tenant, TokenRequest::cached())
            .await
            .ok_or_else(|| UpstreamError::TokenUnavailable {
                tenant: self.tenant.clone(),
            })?;

        let response = self.send_with_retry(&method, url, &token, body).await?;
        if !self.refresh_on.contains(&response.status()) {
            return Ok(response);
        }

        tracing::info!(
            endpoint = %self.name,
            tenant = %self.tenant,
            status = response.status().as_u16(),
            "Upstream rejected token, forcing refresh"
        );
        let Some(fresh) = self
            .token_manager
            .get_token(&self.tenant, TokenRequest::forced())
            .await
        else {
            tracing::warn!(endpoint = %self.name, "Token refresh failed, returning upstream response");
            return Ok(response);
        };
        drop(response);

        self.send_with_retry(&method, url, &fresh, body).await
    }

    async fn send_with_retry(
        &self,
        method: &Method,
        url: &Url,
        token: &str,
        body: &OutboundBody,
    ) -> Result<Response, UpstreamError> {
        let mut attempt = 0u32;
        loop {
            let builder = self
                .http
                .request(method.clone(), url.clone())
                .bearer_auth(token)
                .timeout(self.timeout);
            let builder = body.apply(builder).await?;

            let error = match builder.send().await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };

            if error.is_timeout() {
                tracing::error!(
                    endpoint = %self.name,
                    url = %url,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Upstream request timed out"
                );
                return Err(UpstreamError::Timeout {
                    url: url.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                    source: error,
                });
            }

            if attempt < self.max_retries && is_retriable(is_idempotent(method), &error) {
                let delay = backoff(attempt);
                tracing::warn!(
                    endpoint = %self.name,
                    attempt = attempt + 1,
                    max_retries = self.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient upstream failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            log_transport_error(&self.name, url, &error);
            return Err(UpstreamError::Transport {
                url: url.to_string(),
                source: error,
            });
        }
    }
}

fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE
    )
}

/// Connect failures never reached the upstream and are safe to resend for
/// any request. Other transport failures only for idempotent ones.
pub(crate) fn is_retriable(idempotent: bool, error: &reqwest::Error) -> bool {
    if error.is_timeout() {
        return false;
    }
    error.is_connect() || (idempotent && error.is_request())
}

pub(crate) fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(BASE_BACKOFF_MS.saturating_mul(1u64 << attempt.min(10)))
}

fn log_transport_error(endpoint: &str, url: &Url, error: &reqwest::Error) {
    tracing::error!(
        endpoint = %endpoint,
        url = %url,
        timeout = error.is_timeout(),
        connect = error.is_connect(),
        request = error.is_request(),
        status = ?error.status().map(|s| s.as_u16()),
        os_error = ?os_error_code(error),
        chain = %source_chain(error),
        "Upstream request failed"
    );
}

/// First OS error number found along the source chain.
pub fn os_error_code(error: &(dyn StdError + 'static)) -> Option<i32> {
    let mut current = Some(error);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if let Some(code) = io.raw_os_error() {
                return Some(code);
            }
        }
        current = e.source();
    }
    None
}

pub fn source_chain(error: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![error.to_string()];
    let mut current = error.source();
    while let Some(e) = current {
        parts.push(e.to_string());
        current = e.source();
    }
    parts.join(" -> ")
}
