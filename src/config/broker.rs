//! Broker configuration types.

use std::time::Duration;

use serde::Deserialize;

/// RabbitMQ connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Virtual host. `/` is the broker default.
    pub vhost: String,
    /// Upper bound for each of connect, channel open and topology declare.
    pub connect_timeout_ms: u64,
    /// Upper bound for handing one message to the channel.
    pub publish_timeout_ms: u64,
    /// Consumer tags are `<prefix>-<queue>`.
    pub consumer_tag_prefix: String,
    /// Unacknowledged deliveries the broker may push to each consumer.
    pub prefetch_count: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            connect_timeout_ms: 5000,
            publish_timeout_ms: 5000,
            consumer_tag_prefix: "taskline".to_string(),
            prefetch_count: 16,
        }
    }
}

impl BrokerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}
