//! Redis screen cache.

use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tracing::debug;

use super::{CacheError, Result, ScreenCache};
use crate::config::RedisConfig;
use crate::utils::bootstrap::{connect_with_retry, RetryPolicy};

/// Redis-backed cache. `SET key value EX ttl` per write.
#[derive(Clone)]
pub struct RedisScreenCache {
    conn: ConnectionManager,
}

impl RedisScreenCache {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url())?;
        let address = format!("{}:{}/{}", config.host, config.port, config.db);
        let conn = connect_with_retry("redis", &address, RetryPolicy::default(), || {
            ConnectionManager::new(client.clone())
        })
        .await
        .map_err(|e| CacheError::Connection(e.to_string()))?;

        Ok(Self { conn })
    }
}

#[async_trait]
impl ScreenCache for RedisScreenCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await?;
        debug!(key, hit = value.is_some(), "Screen cache read");
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let bytes = value.len();
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        debug!(key, bytes, ttl_secs = ttl.as_secs(), "Screen cache write");
        Ok(())
    }
}
