//! Screen cache configuration types.

use serde::Deserialize;

/// Cache type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    Redis,
    /// Process-local map (single node, lost on restart).
    #[default]
    Memory,
}

/// Cache configuration (discriminated union).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(rename = "type")]
    pub cache_type: CacheType,
    pub redis: RedisConfig,
    /// Lifetime of a stored screen, in seconds.
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_type: CacheType::Memory,
            redis: RedisConfig::default(),
            ttl_secs: 24 * 60 * 60,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.ttl_secs)
    }
}

/// Redis-specific configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: String::new(),
            db: 0,
        }
    }
}

impl RedisConfig {
    /// Connection URL: `redis://[:password@]host:port/db`.
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                self.password, self.host, self.port, self.db
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_defaults() {
        let cache = CacheConfig::default();
        assert_eq!(cache.cache_type, CacheType::Memory);
        assert_eq!(cache.ttl().as_secs(), 86_400);
    }

    #[test]
    fn test_redis_url() {
        let mut redis = RedisConfig::default();
        assert_eq!(redis.url(), "redis://localhost:6379/0");
        redis.password = "pw".to_string();
        redis.db = 2;
        assert_eq!(redis.url(), "redis://:pw@localhost:6379/2");
    }
}
