//! Screen-sharing cache.
//!
//! Stores the latest screen image per room with a bounded lifetime.
//! - `RedisScreenCache`: shared across replicas
//! - `MemoryScreenCache`: process-local, for single-node use and tests

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::info;

use crate::config::{CacheConfig, CacheType};

#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "redis")]
pub use self::redis::RedisScreenCache;

/// Key prefix of stored screens.
pub const SCREEN_KEY_PREFIX: &str = "ScreenSharing-";

/// Cache key of a room's screen.
pub fn screen_key(room_id: &str) -> String {
    format!("{}{}", SCREEN_KEY_PREFIX, room_id)
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Bytes keyed by string, with expiry.
#[async_trait]
pub trait ScreenCache: Send + Sync {
    /// Stored bytes, or `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
}

/// Process-local cache.
#[derive(Clone, Default)]
pub struct MemoryScreenCache {
    entries: Arc<RwLock<HashMap<String, (Vec<u8>, Instant)>>>,
}

impl MemoryScreenCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScreenCache for MemoryScreenCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, expires)) if *expires > now => return Ok(Some(value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired
        let mut entries = self.entries.write().await;
        if matches!(entries.get(key), Some((_, expires)) if *expires <= now) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let expires = Instant::now() + ttl;
        self.entries
            .write()
            .await
            .insert(key.to_string(), (value, expires));
        Ok(())
    }
}

/// Initialize the cache selected by configuration.
pub async fn init_cache(config: &CacheConfig) -> Result<Arc<dyn ScreenCache>> {
    match config.cache_type {
        CacheType::Redis => {
            #[cfg(feature = "redis")]
            {
                let cache = RedisScreenCache::connect(&config.redis).await?;
                info!(cache_type = "redis", "Screen cache initialized");
                Ok(Arc::new(cache))
            }

            #[cfg(not(feature = "redis"))]
            {
                Err(CacheError::Connection(
                    "Redis support requires the 'redis' feature. Rebuild with --features redis"
                        .to_string(),
                ))
            }
        }
        CacheType::Memory => {
            info!(cache_type = "memory", "Screen cache initialized");
            Ok(Arc::new(MemoryScreenCache::new()))
        }
    }
}
