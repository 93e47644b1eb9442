//! Application configuration.
//!
//! Aggregates the broker, cache, database and logging sections into a single
//! Config struct that can be loaded from YAML files or environment variables.

mod broker;
mod cache;
mod database;
mod logging;

pub use broker::BrokerConfig;
pub use cache::{CacheConfig, CacheType};
pub use database::{DatabaseConfig, DatabaseType, PoolConfig};
pub use logging::{LogFormat, LoggingConfig};

use std::str::FromStr;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "taskline.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "TASKLINE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "TASKLINE";
/// Environment variable for the tracing filter.
pub const LOG_ENV_VAR: &str = "TASKLINE_LOG";
/// Environment variable for the log output format.
pub const LOG_FORMAT_ENV_VAR: &str = "TASKLINE_LOG_FORMAT";

/// Conventional broker variables.
pub const RABBITMQ_HOST_ENV_VAR: &str = "RABBITMQ_HOST";
pub const RABBITMQ_PORT_ENV_VAR: &str = "RABBITMQ_PORT";
pub const RABBITMQ_USER_ENV_VAR: &str = "RABBITMQ_USER";
pub const RABBITMQ_PASSWORD_ENV_VAR: &str = "RABBITMQ_PASSWORD";
pub const RABBITMQ_VHOST_ENV_VAR: &str = "RABBITMQ_VHOST";

/// Conventional cache variables.
pub const REDIS_HOST_ENV_VAR: &str = "REDIS_HOST";
pub const REDIS_PORT_ENV_VAR: &str = "REDIS_PORT";
pub const REDIS_USERNAME_ENV_VAR: &str = "REDIS_USERNAME";
pub const REDIS_PASSWORD_ENV_VAR: &str = "REDIS_PASSWORD";
pub const REDIS_DB_ENV_VAR: &str = "REDIS_DB";
pub const CACHE_TTL_ENV_VAR: &str = "CACHE_TTL_SECS";

/// Conventional database variables.
pub const DB_PATH_ENV_VAR: &str = "DB_PATH";
pub const DB_POOL_MAX_ENV_VAR: &str = "DB_POOL_MAX";
pub const DB_POOL_MIN_ENV_VAR: &str = "DB_POOL_MIN";
pub const DB_POOL_ACQUIRE_ENV_VAR: &str = "DB_POOL_ACQUIRE";
pub const DB_POOL_IDLE_ENV_VAR: &str = "DB_POOL_IDLE";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid value '{value}' for {var}")]
    InvalidValue { var: &'static str, value: String },
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub cache: CacheConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `taskline.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix (`__` separated)
    /// 5. Conventional variables such as `RABBITMQ_HOST` or `DB_PATH`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let mut config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply the conventional, unprefixed environment variables.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(host) = env_string(RABBITMQ_HOST_ENV_VAR) {
            self.broker.host = host;
        }
        if let Some(port) = env_parsed(RABBITMQ_PORT_ENV_VAR)? {
            self.broker.port = port;
        }
        if let Some(user) = env_string(RABBITMQ_USER_ENV_VAR) {
            self.broker.username = user;
        }
        if let Some(password) = env_string(RABBITMQ_PASSWORD_ENV_VAR) {
            self.broker.password = password;
        }
        if let Some(vhost) = env_string(RABBITMQ_VHOST_ENV_VAR) {
            self.broker.vhost = vhost;
        }

        if let Some(host) = env_string(REDIS_HOST_ENV_VAR) {
            self.cache.host = host;
        }
        if let Some(port) = env_parsed(REDIS_PORT_ENV_VAR)? {
            self.cache.port = port;
        }
        if let Some(username) = env_string(REDIS_USERNAME_ENV_VAR) {
            self.cache.username = Some(username);
        }
        if let Some(password) = env_string(REDIS_PASSWORD_ENV_VAR) {
            self.cache.password = Some(password);
        }
        if let Some(db) = env_parsed(REDIS_DB_ENV_VAR)? {
            self.cache.db = db;
        }
        if let Some(ttl) = env_parsed(CACHE_TTL_ENV_VAR)? {
            self.cache.ttl_secs = ttl;
        }

        if let Some(path) = env_string(DB_PATH_ENV_VAR) {
            self.database.path = path;
        }
        if let Some(max) = env_parsed(DB_POOL_MAX_ENV_VAR)? {
            self.database.pool.max = max;
        }
        if let Some(min) = env_parsed(DB_POOL_MIN_ENV_VAR)? {
            self.database.pool.min = min;
        }
        if let Some(acquire) = env_parsed(DB_POOL_ACQUIRE_ENV_VAR)? {
            self.database.pool.acquire_ms = acquire;
        }
        if let Some(idle) = env_parsed(DB_POOL_IDLE_ENV_VAR)? {
            self.database.pool.idle_ms = idle;
        }

        match env_string(LOG_FORMAT_ENV_VAR).as_deref() {
            None => {}
            Some("json") => self.logging.format = LogFormat::Json,
            Some("pretty") => self.logging.format = LogFormat::Pretty,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    var: LOG_FORMAT_ENV_VAR,
                    value: other.to_string(),
                })
            }
        }

        Ok(())
    }

    /// Create config for testing: in-memory cache and repository.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.cache.cache_type = CacheType::Memory;
        config.database.database_type = DatabaseType::Memory;
        config
    }
}

/// Non-empty value of an environment variable.
fn env_string(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env_string(var) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value }),
    }
}
