use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Gateway service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Allow LAN access
    /// - false: listen on 127.0.0.1 only
    /// - true: listen on 0.0.0.0
    #[serde(default)]
    pub allow_lan_access: bool,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Require `x-api-key` on /api
    #[serde(default = "default_use_api_key")]
    pub use_api_key: bool,

    /// Fixed inbound API key. When unset the key is derived from the key file.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Secret file the API key is derived from.
    /// Defaults to `~/.health_api_gateway/.authorized_key/.access.key`.
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,

    /// Upstream request timeout (milliseconds)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Retry ceiling for transient transport failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Hospital code sent in every credential payload
    #[serde(default)]
    pub hospital_code: String,

    /// Cache key suffix for issued tokens (`<tenant><suffix>`)
    #[serde(default = "default_token_key_suffix")]
    pub token_key_suffix: String,

    /// Cache key suffix for the last-used credential payload
    #[serde(default = "default_auth_payload_key_suffix")]
    pub auth_payload_key_suffix: String,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Independently authenticated upstream applications
    #[serde(default = "default_tenants")]
    pub tenants: BTreeMap<String, TenantConfig>,

    /// Named resource upstreams selectable by the endpoint selector
    #[serde(default = "default_upstreams")]
    pub upstreams: BTreeMap<String, UpstreamConfig>,

    /// Upstream used when no selector is given
    #[serde(default = "default_upstream_name")]
    pub default_upstream: String,

    /// Outbound proxy configuration
    #[serde(default)]
    pub upstream_proxy: UpstreamProxyConfig,
}

/// Cache backend connection parameters. No host means in-process store from the start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_cache_port")]
    pub port: u16,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TenantConfig {
    /// Base URL of the token-issuing service
    pub auth_url: String,
    /// Secret used to hash passwords into the credential payload
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub base_url: String,
    /// Tenant whose token is attached to requests for this upstream
    pub tenant: String,
    /// Response statuses that trigger a forced token refresh and a single replay
    #[serde(default = "default_refresh_on")]
    pub refresh_on: Vec<u16>,
}

/// Outbound proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpstreamProxyConfig {
    /// Enabled
    pub enabled: bool,
    /// Proxy address (http://, https://, socks5://)
    pub url: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_cache_port(),
            password: None,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            allow_lan_access: false,
            port: default_port(),
            use_api_key: default_use_api_key(),
            api_key: None,
            api_key_file: None,
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
            hospital_code: String::new(),
            token_key_suffix: default_token_key_suffix(),
            auth_payload_key_suffix: default_auth_payload_key_suffix(),
            cache: CacheConfig::default(),
            tenants: default_tenants(),
            upstreams: default_upstreams(),
            default_upstream: default_upstream_name(),
            upstream_proxy: UpstreamProxyConfig::default(),
        }
    }
}

pub const DEFAULT_IC_URL: &str = "https://cvp1.moph.go.th";
pub const DEFAULT_FDH_URL: &str = "https://fdh.moph.go.th";
pub const DEFAULT_AUTH_SECRET: &str = "$jwt@moph#";

fn default_port() -> u16 {
    3000
}

fn default_use_api_key() -> bool {
    true
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_token_key_suffix() -> String {
    "-auth-token".to_string()
}

fn default_auth_payload_key_suffix() -> String {
    "-auth-payload".to_string()
}

fn default_cache_port() -> u16 {
    6379
}

fn default_refresh_on() -> Vec<u16> {
    vec![401]
}

fn default_upstream_name() -> String {
    "mophic".to_string()
}

fn default_tenants() -> BTreeMap<String, TenantConfig> {
    let mut tenants = BTreeMap::new();
    tenants.insert(
        "mophic".to_string(),
        TenantConfig {
            auth_url: DEFAULT_IC_URL.to_string(),
            secret: DEFAULT_AUTH_SECRET.to_string(),
        },
    );
    tenants.insert(
        "fdh".to_string(),
        TenantConfig {
            auth_url: DEFAULT_FDH_URL.to_string(),
            secret: DEFAULT_AUTH_SECRET.to_string(),
        },
    );
    tenants
}

fn default_upstreams() -> BTreeMap<String, UpstreamConfig> {
    let upstream = |base_url: &str, tenant: &str, refresh_on: &[u16]| UpstreamConfig {
        base_url: base_url.to_string(),
        tenant: tenant.to_string(),
        refresh_on: refresh_on.to_vec(),
    };

    let mut upstreams = BTreeMap::new();
    upstreams.insert("mophic".to_string(), upstream(DEFAULT_IC_URL, "mophic", &[401]));
    upstreams.insert(
        "epidem".to_string(),
        upstream("https://epidemcenter.moph.go.th/epidem", "mophic", &[401]),
    );
    // PHR answers 501 for stale tokens as well
    upstreams.insert(
        "phr".to_string(),
        upstream("https://phr1.moph.go.th", "mophic", &[401, 501]),
    );
    upstreams.insert(
        "claim".to_string(),
        upstream("https://claim-nhso.moph.go.th", "fdh", &[401]),
    );
    upstreams.insert("fdh".to_string(), upstream(DEFAULT_FDH_URL, "fdh", &[401]));
    upstreams
}

impl ProxyConfig {
    /// Get the actual listen address
    pub fn get_bind_address(&self) -> &str {
        if self.allow_lan_access {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        }
    }

    pub fn token_key(&self, tenant: &str) -> String {
        format!("{}{}", tenant, self.token_key_suffix)
    }

    pub fn auth_payload_key(&self, tenant: &str) -> String {
        format!("{}{}", tenant, self.auth_payload_key_suffix)
    }

    /// Check cross references between upstreams and tenants.
    pub fn validate(&self) -> Result<(), String> {
        if self.hospital_code.trim().is_empty() {
            return Err("hospital code (MOPH_HCODE) is required".to_string());
        }
        for (name, upstream) in &self.upstreams {
            if !self.tenants.contains_key(&upstream.tenant) {
                return Err(format!(
                    "upstream '{}' refers to unknown tenant '{}'",
                    name, upstream.tenant
                ));
            }
            url::Url::parse(&upstream.base_url)
                .map_err(|e| format!("upstream '{}' has invalid base URL: {}", name, e))?;
        }
        if !self.upstreams.contains_key(&self.default_upstream) {
            return Err(format!(
                "default upstream '{}' is not configured",
                self.default_upstream
            ));
        }
        Ok(())
    }
}
