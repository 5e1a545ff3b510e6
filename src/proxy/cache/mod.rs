//! Key/value cache with a networked backend that degrades to an in-process store.
//!
//! Starts `Networked` when a cache host is configured and reachable, otherwise
//! `Local`. The first failed backend call switches the whole cache to `Local`
//! for the rest of the process and the failing operation is replayed against
//! the in-process store, so callers only ever see the final result.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use thiserror::Error;

use crate::proxy::config::CacheConfig;
pub use memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Cache backend error: {0}")]
    Backend(String),
}

/// Networked backend operations.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError>;
    async fn expire_at(&self, key: &str, unix_seconds: i64) -> Result<(), CacheError>;
    async fn del(&self, key: &str) -> Result<u64, CacheError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackendState {
    Networked,
    Local,
}

impl CacheBackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheBackendState::Networked => "networked",
            CacheBackendState::Local => "local",
        }
    }
}

pub struct KeyValueCache {
    /// `None` once the cache runs on the in-process store. Never set back.
    remote: RwLock<Option<Arc<dyn RemoteStore>>>,
    local: MemoryStore,
}

impl KeyValueCache {
    /// In-process store only
    pub fn local() -> Self {
        Self {
            remote: RwLock::new(None),
            local: MemoryStore::new(),
        }
    }

    pub fn with_remote(remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            remote: RwLock::new(Some(remote)),
            local: MemoryStore::new(),
        }
    }

    /// Build the cache from configuration, falling back to the in-process
    /// store when no host is configured or the server cannot be reached.
    pub async fn connect(config: &CacheConfig) -> Self {
        let host = config
            .host
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty());

        let Some(host) = host else {
            tracing::warn!("Cache fallback: cache host is not configured, using in-memory store");
            return Self::local();
        };

        match RedisStore::connect(host, config.port, config.password.as_deref()).await {
            Ok(store) => {
                tracing::info!(host = %host, port = config.port, "Redis: connected");
                Self::with_remote(Arc::new(store))
            }
            Err(e) => {
                tracing::warn!(
                    host = %host,
                    port = config.port,
                    error = %e,
                    "Cache fallback: Redis unavailable, using in-memory store"
                );
                Self::local()
            }
        }
    }

    pub fn backend_state(&self) -> CacheBackendState {
        match self.remote() {
            Some(_) => CacheBackendState::Networked,
            None => CacheBackendState::Local,
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(remote) = self.remote() {
            match remote.get(key).await {
                Ok(value) => return value,
                Err(e) => self.fall_back("get failed", &e),
            }
        }
        self.local.get(key)
    }

    pub async fn set(&self, key: &str, value: &str) {
        if let Some(remote) = self.remote() {
            match remote.set(key, value).await {
                Ok(()) => return,
                Err(e) => self.fall_back("set failed", &e),
            }
        }
        self.local.set(key, value.to_string(), None);
    }

    /// Store `value` until the absolute unix timestamp `unix_seconds`.
    pub async fn set_with_expiry(&self, key: &str, value: &str, unix_seconds: i64) {
        if let Some(remote) = self.remote() {
            match remote.set(key, value).await {
                Ok(()) => match remote.expire_at(key, unix_seconds).await {
                    Ok(()) => return,
                    Err(e) => {
                        // Never leave a value without its expiry behind
                        if let Err(del_error) = remote.del(key).await {
                            tracing::warn!(
                                key = %key,
                                error = %del_error,
                                "Cache cleanup failed, remote value may outlive its expiry"
                            );
                        }
                        self.fall_back("expire failed", &e);
                    }
                },
                Err(e) => self.fall_back("set with expiry failed", &e),
            }
        }
        self.local
            .set(key, value.to_string(), Some(unix_seconds.saturating_mul(1000)));
    }

    /// Returns the number of removed keys.
    pub async fn delete(&self, key: &str) -> u64 {
        if let Some(remote) = self.remote() {
            match remote.del(key).await {
                Ok(removed) => return removed,
                Err(e) => self.fall_back("delete failed", &e),
            }
        }
        self.local.delete(key)
    }

    fn remote(&self) -> Option<Arc<dyn RemoteStore>> {
        self.remote
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn fall_back(&self, reason: &str, error: &CacheError) {
        let previous = self
            .remote
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        // Dropping the last handle closes the connection
        if previous.is_some() {
            tracing::warn!(
                error = %error,
                "Cache fallback: Redis {} -> use in-memory store instead",
                reason
            );
        }
    }
}
