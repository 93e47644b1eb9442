//! Key-value cache with per-entry TTL.
//!
//! This module contains:
//! - `CacheStore` trait: raw string get/set/del/exists
//! - `CacheGateway`: typed JSON access and the task key scheme
//! - Implementations: Redis, Mock (in-memory)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
#[cfg(not(feature = "redis"))]
use tracing::error;
use tracing::{debug, info};

use crate::config::{CacheConfig, CacheType};
use crate::task::TaskId;

pub mod mock;
#[cfg(feature = "redis")]
pub mod redis;

pub use mock::MockCacheStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisCacheStore;

/// Key holding the serialized task list.
pub const ALL_TASKS_KEY: &str = "all_tasks";

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Key holding a single serialized task.
pub fn task_key(id: TaskId) -> String {
    format!("task:{}", id)
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Raw string storage with expiry.
///
/// Implementations:
/// - `RedisCacheStore`: `SET key value EX ttl`
/// - `MockCacheStore`: in-memory map, expiry checked on read
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    async fn del(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Typed view over a `CacheStore`.
///
/// Values are written as JSON, except strings, which are written raw. On
/// read, text that does not parse as the requested type is retried as a
/// plain JSON string so raw strings round-trip.
#[derive(Clone)]
pub struct CacheGateway {
    store: Arc<dyn CacheStore>,
    default_ttl: Duration,
}

impl CacheGateway {
    pub fn new(store: Arc<dyn CacheStore>, default_ttl: Duration) -> Self {
        Self { store, default_ttl }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => serde_json::from_value(serde_json::Value::String(raw))
                .map(Some)
                .map_err(|_| CacheError::Serialization(e)),
        }
    }

    /// Store `value` under `key`. `ttl` of `None` uses the default TTL.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let raw = match serde_json::to_value(value)? {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        let ttl = ttl.unwrap_or(self.default_ttl);
        self.store.set(key, raw, ttl).await?;
        debug!(key = %key, ttl_secs = ttl.as_secs(), "Cached value");
        Ok(())
    }

    pub async fn del(&self, key: &str) -> Result<()> {
        self.store.del(key).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.store.exists(key).await
    }
}

/// Build a cache gateway for the configured backend.
pub async fn init_cache(config: &CacheConfig) -> Result<CacheGateway> {
    let store: Arc<dyn CacheStore> = match config.cache_type {
        #[cfg(feature = "redis")]
        CacheType::Redis => Arc::new(RedisCacheStore::new(config).await?),
        #[cfg(not(feature = "redis"))]
        CacheType::Redis => {
            error!("Redis cache requested but 'redis' feature is not enabled");
            return Err(CacheError::NotImplemented(
                "Redis support requires the 'redis' feature".to_string(),
            ));
        }
        CacheType::Memory => {
            info!("Cache: in-memory");
            Arc::new(MockCacheStore::new())
        }
    };
    Ok(CacheGateway::new(store, config.ttl()))
}
