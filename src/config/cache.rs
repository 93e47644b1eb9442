//! Cache configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Cache backend discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    #[default]
    Redis,
    Memory,
}

/// Cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(rename = "type")]
    pub cache_type: CacheType,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Redis logical database index.
    pub db: i64,
    /// TTL applied to every entry written by the task service.
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_type: CacheType::Redis,
            host: "localhost".to_string(),
            port: 6379,
            username: None,
            password: None,
            db: 0,
            ttl_secs: 60,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Connection info for the Redis client.
    #[cfg(feature = "redis")]
    pub fn redis_connection_info(&self) -> redis::ConnectionInfo {
        redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: redis::RedisConnectionInfo {
                db: self.db,
                username: self.username.clone(),
                password: self.password.clone(),
                ..Default::default()
            },
        }
    }
}

#[cfg(all(test, feature = "redis"))]
mod tests {
    use super::*;

    #[test]
    fn test_redis_connection_info_carries_credentials() {
        let config = CacheConfig {
            host: "cache.internal".to_string(),
            port: 6380,
            username: Some("app".to_string()),
            password: Some("secret".to_string()),
            db: 2,
            ..Default::default()
        };

        let info = config.redis_connection_info();

        assert_eq!(
            info.addr,
            redis::ConnectionAddr::Tcp("cache.internal".to_string(), 6380)
        );
        assert_eq!(info.redis.db, 2);
        assert_eq!(info.redis.username.as_deref(), Some("app"));
        assert_eq!(info.redis.password.as_deref(), Some("secret"));
    }
}
