//! Relational store configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Repository backend discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    #[default]
    Sqlite,
    Memory,
}

/// Connection pool sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max: u32,
    pub min: u32,
    /// How long to wait for a free connection before failing.
    pub acquire_ms: u64,
    /// Idle connections above `min` are closed after this long.
    pub idle_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max: 5,
            min: 1,
            acquire_ms: 30_000,
            idle_ms: 10_000,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    #[serde(rename = "type")]
    pub database_type: DatabaseType,
    /// SQLite file path. `:memory:` opens a private in-memory database.
    pub path: String,
    pub pool: PoolConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_type: DatabaseType::Sqlite,
            path: "./data/tasks.db".to_string(),
            pool: PoolConfig::default(),
        }
    }
}
