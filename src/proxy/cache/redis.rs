// Networked cache backend on top of a redis connection manager

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::time::Duration;

use super::{CacheError, RemoteStore};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect and verify the server answers PING.
    pub async fn connect(host: &str, port: u16, password: Option<&str>) -> Result<Self, CacheError> {
        let url = connection_url(host, port, password)?;
        let client = redis::Client::open(url.as_str())?;

        let mut conn = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                CacheError::Backend(format!("connecting to {}:{} timed out", host, port))
            })??;

        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        tracing::debug!(reply = %pong, "Redis PING ok");

        Ok(Self { conn })
    }
}

fn connection_url(host: &str, port: u16, password: Option<&str>) -> Result<url::Url, CacheError> {
    let mut url = url::Url::parse(&format!("redis://{}:{}/", host, port))
        .map_err(|e| CacheError::Backend(format!("invalid redis address: {}", e)))?;
    if let Some(password) = password.filter(|p| !p.is_empty()) {
        url.set_password(Some(password))
            .map_err(|_| CacheError::Backend("cannot attach redis password".to_string()))?;
    }
    Ok(url)
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn expire_at(&self, key: &str, unix_seconds: i64) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("EXPIREAT")
            .arg(key)
            .arg(unix_seconds)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<u64, CacheError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await?;
        Ok(removed)
    }
}
