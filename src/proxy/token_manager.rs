use dashmap::DashMap;
use reqwest::{header, Client};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use url::Url;

use crate::proxy::cache::KeyValueCache;
use crate::proxy::common::claims::{decode_expiry, ClaimsError};
use crate::proxy::common::AuthPayload;
use crate::proxy::config::{ProxyConfig, TenantConfig};
use crate::proxy::upstream::client::{backoff, is_retriable};

/// Tokens are cached until this many seconds before their own `exp` claim
pub const EXPIRY_MARGIN_SECS: i64 = 60;

const TOKEN_ACTION: &str = "get_moph_access_token";

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Options for [`TokenManager::get_token`]
#[derive(Debug, Clone, Default)]
pub struct TokenRequest {
    /// Drop the cached token and issue a new one
    pub force: bool,
    /// Fresh credentials; replaces the stored payload on success
    pub credentials: Option<Credentials>,
}

impl TokenRequest {
    pub fn cached() -> Self {
        Self::default()
    }

    pub fn forced() -> Self {
        Self {
            force: true,
            credentials: None,
        }
    }

    pub fn login(username: &str, password: &str) -> Self {
        Self {
            force: true,
            credentials: Some(Credentials {
                username: username.to_string(),
                password: password.to_string(),
            }),
        }
    }
}

#[derive(Error, Debug)]
enum TokenError {
    #[error("unknown tenant '{0}'")]
    UnknownTenant(String),

    #[error("tenant secret cannot be used as HMAC key")]
    InvalidSecret,

    #[error("invalid auth URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("stored auth payload is corrupt: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("token endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("empty token received")]
    EmptyToken,

    #[error(transparent)]
    Claims(#[from] ClaimsError),
}

/// Per-tenant issuance gate. `issued` counts completed issuances so callers
/// that queued behind an issuance can reuse its result.
#[derive(Default)]
struct TenantGate {
    lock: tokio::sync::Mutex<()>,
    issued: AtomicU64,
}

pub struct TokenManager {
    cache: Arc<KeyValueCache>,
    http: Client,
    config: ProxyConfig,
    gates: DashMap<String, Arc<TenantGate>>,
}

impl TokenManager {
    /// Create new TokenManager
    pub fn new(config: &ProxyConfig, cache: Arc<KeyValueCache>, http: Client) -> Self {
        Self {
            cache,
            http,
            config: config.clone(),
            gates: DashMap::new(),
        }
    }

    pub fn has_tenant(&self, tenant: &str) -> bool {
        self.config.tenants.contains_key(tenant)
    }

    /// Get a bearer token for `tenant`.
    ///
    /// Returns `None` when the tenant has never logged in or when issuance
    /// failed; the cause is logged here and not reported further.
    pub async fn get_token(&self, tenant: &str, request: TokenRequest) -> Option<String> {
        match self.try_get_token(tenant, &request).await {
            Ok(token) => token,
            Err(e) => {
                tracing::error!(tenant = %tenant, error = %e, "Token issuance failed");
                None
            }
        }
    }

    async fn try_get_token(
        &self,
        tenant: &str,
        request: &TokenRequest,
    ) -> Result<Option<String>, TokenError> {
        let tenant_config = self
            .config
            .tenants
            .get(tenant)
            .ok_or_else(|| TokenError::UnknownTenant(tenant.to_string()))?;
        let token_key = self.config.token_key(tenant);
        let payload_key = self.config.auth_payload_key(tenant);

        let gate = self.gate(tenant);
        let seen = gate.issued.load(Ordering::SeqCst);

        if !request.force {
            if let Some(token) = self.cached_token(&token_key).await {
                return Ok(Some(token));
            }
        }

        let _guard = gate.lock.lock().await;

        if request.credentials.is_none() && gate.issued.load(Ordering::SeqCst) != seen {
            if let Some(token) = self.cached_token(&token_key).await {
                tracing::debug!(tenant = %tenant, "Reusing token issued by a concurrent caller");
                return Ok(Some(token));
            }
        }

        if request.force {
            self.cache.delete(&token_key).await;
        }

        let payload = match &request.credentials {
            Some(credentials) => AuthPayload::create(
                &credentials.username,
                &credentials.password,
                &tenant_config.secret,
                &self.config.hospital_code,
            )
            .map_err(|_| TokenError::InvalidSecret)?,
            None => match self.cache.get(&payload_key).await {
                Some(saved) if !saved.trim().is_empty() => serde_json::from_str(&saved)?,
                _ => {
                    tracing::info!(tenant = %tenant, "No stored credentials, tenant is not logged in");
                    return Ok(None);
                }
            },
        };

        let token = self.request_token(tenant_config, &payload).await?;
        let exp = decode_expiry(&token)?;
        tracing::info!(tenant = %tenant, exp = exp, "New token issued");

        self.cache
            .set_with_expiry(&token_key, &token, exp - EXPIRY_MARGIN_SECS)
            .await;
        self.cache
            .set(&payload_key, &serde_json::to_string(&payload)?)
            .await;
        gate.issued.fetch_add(1, Ordering::SeqCst);

        Ok(Some(token))
    }

    fn gate(&self, tenant: &str) -> Arc<TenantGate> {
        self.gates
            .entry(tenant.to_string())
            .or_default()
            .value()
            .clone()
    }

    async fn cached_token(&self, token_key: &str) -> Option<String> {
        self.cache
            .get(token_key)
            .await
            .filter(|token| !token.trim().is_empty())
    }

    async fn request_token(
        &self,
        tenant: &TenantConfig,
        payload: &AuthPayload,
    ) -> Result<String, TokenError> {
        let url = token_url(&tenant.auth_url)?;

        // Issuance has no upstream side effects and is resent like an idempotent request
        let mut attempt = 0u32;
        let response = loop {
            let result = self
                .http
                .post(url.clone())
                .header(header::ACCEPT, "application/json")
                .json(payload)
                .send()
                .await;
            match result {
                Ok(response) => break response,
                Err(e) if attempt < self.config.max_retries && is_retriable(true, &e) => {
                    let delay = backoff(attempt);
                    tracing::warn!(
                        url = %url,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Token request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(TokenError::Status {
                status: status.as_u16(),
                body: body.trim().chars().take(200).collect(),
            });
        }

        parse_token_body(&body)
    }

    /// Whether the stored payload for `tenant` was built from these credentials.
    pub async fn is_current_payload(&self, tenant: &str, username: &str, password: &str) -> bool {
        let Some(tenant_config) = self.config.tenants.get(tenant) else {
            return false;
        };
        let Some(saved) = self.cache.get(&self.config.auth_payload_key(tenant)).await else {
            return false;
        };
        let Ok(saved) = serde_json::from_str::<AuthPayload>(&saved) else {
            return false;
        };

        AuthPayload::create(username, password, &tenant_config.secret, &self.config.hospital_code)
            .map(|expected| expected == saved)
            .unwrap_or(false)
    }

    /// Force a refresh for every tenant from its stored payload.
    /// Returns the number of tenants that now hold a token.
    pub async fn warm_tokens(&self) -> usize {
        let mut ready = 0;
        for tenant in self.config.tenants.keys() {
            match self.get_token(tenant, TokenRequest::forced()).await {
                Some(_) => {
                    tracing::info!(tenant = %tenant, "Prefetched token");
                    ready += 1;
                }
                None => tracing::warn!(tenant = %tenant, "Unable to prefetch token"),
            }
        }
        ready
    }
}

fn token_url(auth_url: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(auth_url)?;
    let path = format!("{}/token", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().append_pair("Action", TOKEN_ACTION);
    Ok(url)
}

/// The endpoint answers with the raw JWT, occasionally JSON-quoted.
fn parse_token_body(body: &str) -> Result<String, TokenError> {
    let trimmed = body.trim();
    let token = if trimmed.starts_with('"') {
        serde_json::from_str::<String>(trimmed)?
    } else {
        trimmed.to_string()
    };

    if token.trim().is_empty() {
        return Err(TokenError::EmptyToken);
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::cache::{CacheError, RemoteStore};
    use crate::proxy::common::claims::make_token;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Remote store double that records the expiry written for each key.
    #[derive(Default)]
    struct RecordingRemote {
        values: Mutex<HashMap<String, String>>,
        expiries: Mutex<HashMap<String, i64>>,
    }

    #[async_trait]
    impl RemoteStore for RecordingRemote {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            Ok(self.values.lock().unwrap().get(key).cloned())
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
            self.values
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn expire_at(&self, key: &str, unix_seconds: i64) -> Result<(), CacheError> {
            self.expiries
                .lock()
                .unwrap()
                .insert(key.to_string(), unix_seconds);
            Ok(())
        }

        async fn del(&self, key: &str) -> Result<u64, CacheError> {
            Ok(self.values.lock().unwrap().remove(key).map_or(0, |_| 1))
        }
    }

    fn config_for(server: &MockServer) -> ProxyConfig {
        let mut config = ProxyConfig {
            hospital_code: "10670".to_string(),
            ..ProxyConfig::default()
        };
        for tenant in config.tenants.values_mut() {
            tenant.auth_url = server.uri();
        }
        config
    }

    fn manager(config: &ProxyConfig, cache: Arc<KeyValueCache>) -> TokenManager {
        TokenManager::new(config, cache, Client::new())
    }

    fn fresh_token(sub: &str) -> (String, i64) {
        let exp = chrono::Utc::now().timestamp() + 3600;
        (make_token(&json!({ "sub": sub, "exp": exp })), exp)
    }

    async fn store_payload(cache: &KeyValueCache, config: &ProxyConfig, tenant: &str) {
        let secret = &config.tenants[tenant].secret;
        let payload = AuthPayload::create("user", "pw", secret, &config.hospital_code).unwrap();
        cache
            .set(
                &config.auth_payload_key(tenant),
                &serde_json::to_string(&payload).unwrap(),
            )
            .await;
    }

    #[tokio::test]
    async fn test_not_logged_in_returns_none_without_upstream_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let config = config_for(&server);
        let tm = manager(&config, Arc::new(KeyValueCache::local()));
        assert_eq!(tm.get_token("mophic", TokenRequest::cached()).await, None);
        assert_eq!(tm.get_token("mophic", TokenRequest::forced()).await, None);
    }

    #[tokio::test]
    async fn test_login_caches_token_with_margin_and_payload() {
        let server = MockServer::start().await;
        let config = config_for(&server);
        let (token, exp) = fresh_token("a");
        let expected_payload =
            AuthPayload::create("user", "pw", &config.tenants["mophic"].secret, "10670").unwrap();

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(query_param("Action", "get_moph_access_token"))
            .and(body_json(&expected_payload))
            .respond_with(ResponseTemplate::new(200).set_body_string(token.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let remote = Arc::new(RecordingRemote::default());
        let cache = Arc::new(KeyValueCache::with_remote(remote.clone()));
        let tm = manager(&config, cache.clone());

        let issued = tm.get_token("mophic", TokenRequest::login("user", "pw")).await;
        assert_eq!(issued.as_deref(), Some(token.as_str()));

        let expiries = remote.expiries.lock().unwrap().clone();
        assert_eq!(expiries["mophic-auth-token"], exp - EXPIRY_MARGIN_SECS);
        assert!(!expiries.contains_key("mophic-auth-payload"));

        let stored = cache.get("mophic-auth-payload").await.unwrap();
        assert_eq!(
            serde_json::from_str::<AuthPayload>(&stored).unwrap(),
            expected_payload
        );

        // Served from cache afterwards
        let again = tm.get_token("mophic", TokenRequest::cached()).await;
        assert_eq!(again.as_deref(), Some(token.as_str()));
    }

    #[tokio::test]
    async fn test_force_refresh_uses_stored_payload() {
        let server = MockServer::start().await;
        let config = config_for(&server);
        let (token, _) = fresh_token("b");
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(token.clone()))
            .expect(2)
            .mount(&server)
            .await;

        let cache = Arc::new(KeyValueCache::local());
        store_payload(&cache, &config, "fdh").await;
        let tm = manager(&config, cache.clone());

        assert_eq!(tm.get_token("fdh", TokenRequest::cached()).await, Some(token.clone()));
        assert_eq!(tm.get_token("fdh", TokenRequest::cached()).await, Some(token.clone()));
        assert_eq!(tm.get_token("fdh", TokenRequest::forced()).await, Some(token));
    }

    #[tokio::test]
    async fn test_issuance_failure_returns_none() {
        let server = MockServer::start().await;
        let config = config_for(&server);
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let tm = manager(&config, Arc::new(KeyValueCache::local()));
        assert_eq!(tm.get_token("mophic", TokenRequest::login("u", "p")).await, None);
    }

    #[tokio::test]
    async fn test_undecodable_token_returns_none() {
        let server = MockServer::start().await;
        let config = config_for(&server);
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not-a-jwt"))
            .mount(&server)
            .await;

        let cache = Arc::new(KeyValueCache::local());
        let tm = manager(&config, cache.clone());
        assert_eq!(tm.get_token("mophic", TokenRequest::login("u", "p")).await, None);
        assert_eq!(cache.get("mophic-auth-token").await, None);
    }

    #[tokio::test]
    async fn test_unknown_tenant_returns_none() {
        let tm = manager(&ProxyConfig::default(), Arc::new(KeyValueCache::local()));
        assert_eq!(tm.get_token("nobody", TokenRequest::login("u", "p")).await, None);
    }

    #[tokio::test]
    async fn test_concurrent_misses_issue_once() {
        let server = MockServer::start().await;
        let config = config_for(&server);
        let (token, _) = fresh_token("c");
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(token.clone())
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cache = Arc::new(KeyValueCache::local());
        store_payload(&cache, &config, "mophic").await;
        let tm = Arc::new(manager(&config, cache));

        let calls = (0..8).map(|_| {
            let tm = tm.clone();
            tokio::spawn(async move { tm.get_token("mophic", TokenRequest::cached()).await })
        });
        for result in futures::future::join_all(calls).await {
            assert_eq!(result.unwrap().as_deref(), Some(token.as_str()));
        }
    }

    #[tokio::test]
    async fn test_concurrent_forced_refreshes_share_one_issuance() {
        let server = MockServer::start().await;
        let config = config_for(&server);
        let (token, _) = fresh_token("d");
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(token.clone())
                    .set_delay(Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cache = Arc::new(KeyValueCache::local());
        store_payload(&cache, &config, "mophic").await;
        let tm = manager(&config, cache);

        let (a, b) = tokio::join!(
            tm.get_token("mophic", TokenRequest::forced()),
            tm.get_token("mophic", TokenRequest::forced())
        );
        assert_eq!(a.as_deref(), Some(token.as_str()));
        assert_eq!(b.as_deref(), Some(token.as_str()));
    }

    #[tokio::test]
    async fn test_is_current_payload() {
        let config = ProxyConfig {
            hospital_code: "10670".to_string(),
            ..ProxyConfig::default()
        };
        let cache = Arc::new(KeyValueCache::local());
        let tm = manager(&config, cache.clone());
        assert!(!tm.is_current_payload("mophic", "user", "pw").await);

        store_payload(&cache, &config, "mophic").await;
        assert!(tm.is_current_payload("mophic", "user", "pw").await);
        assert!(!tm.is_current_payload("mophic", "user", "other").await);
        assert!(!tm.is_current_payload("fdh", "user", "pw").await);
    }

    #[tokio::test]
    async fn test_warm_tokens_counts_ready_tenants() {
        let server = MockServer::start().await;
        let config = config_for(&server);
        let (token, _) = fresh_token("e");
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(token))
            .expect(1)
            .mount(&server)
            .await;

        let cache = Arc::new(KeyValueCache::local());
        store_payload(&cache, &config, "fdh").await;
        let tm = manager(&config, cache);
        assert_eq!(tm.warm_tokens().await, 1);
    }

    /// Auth endpoint that hangs up on the first `drops` connections, then issues `token`.
    async fn flaky_auth_server(drops: usize, token: String) -> (String, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let seen = counter.fetch_add(1, Ordering::SeqCst);
                read_request(&mut stream).await;
                if seen < drops {
                    continue;
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    token.len(),
                    token
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        (format!("http://{}", addr), accepted)
    }

    async fn read_request(stream: &mut tokio::net::TcpStream) {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let Ok(n) = stream.read(&mut buf).await else { return };
            if n == 0 {
                return;
            }
            data.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&data).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if data.len() >= end + 4 + length {
                    return;
                }
            }
        }
    }

    fn config_with_auth(auth_url: &str, max_retries: u32) -> ProxyConfig {
        let mut config = ProxyConfig {
            hospital_code: "10670".to_string(),
            max_retries,
            ..ProxyConfig::default()
        };
        for tenant in config.tenants.values_mut() {
            tenant.auth_url = auth_url.to_string();
        }
        config
    }

    #[tokio::test]
    async fn test_dropped_token_request_is_retried() {
        let (token, _) = fresh_token("a");
        let (auth_url, accepted) = flaky_auth_server(1, token.clone()).await;
        let config = config_with_auth(&auth_url, 2);

        let tm = manager(&config, Arc::new(KeyValueCache::local()));
        assert_eq!(
            tm.get_token("mophic", TokenRequest::login("u", "p")).await,
            Some(token)
        );
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_token_request_retries_are_bounded() {
        let (token, _) = fresh_token("a");
        let (auth_url, accepted) = flaky_auth_server(usize::MAX, token).await;
        let config = config_with_auth(&auth_url, 2);

        let tm = manager(&config, Arc::new(KeyValueCache::local()));
        assert_eq!(tm.get_token("mophic", TokenRequest::login("u", "p")).await, None);
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_token_url() {
        let url = token_url("https://auth.example.org/base/").unwrap();
        assert_eq!(
            url.as_str(),
            "https://auth.example.org/base/token?Action=get_moph_access_token"
        );
        let url = token_url("https://auth.example.org").unwrap();
        assert_eq!(
            url.as_str(),
            "https://auth.example.org/token?Action=get_moph_access_token"
        );
    }

    #[test]
    fn test_parse_token_body() {
        assert_eq!(parse_token_body(" abc.def.ghi \n").unwrap(), "abc.def.ghi");
        assert_eq!(parse_token_body("\"abc.def.ghi\"").unwrap(), "abc.def.ghi");
        assert!(matches!(parse_token_body("  "), Err(TokenError::EmptyToken)));
    }
}
