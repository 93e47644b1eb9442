//! Message broker plumbing for task notifications.
//!
//! This module contains:
//! - `BrokerConnector` / `BrokerConnection` / `BrokerChannel` traits: the
//!   broker surface the pipeline needs (declare, publish, consume)
//! - `BrokerConnectionManager`: single lazily-opened connection and channel
//! - Topology declaration, the task publisher and the task consumer
//! - Implementations: AMQP (RabbitMQ via lapin), Mock (in-memory)

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
#[cfg(feature = "amqp")]
use tracing::info;

#[cfg(feature = "amqp")]
use crate::config::BrokerConfig;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod connection;
pub mod consumer;
pub mod mock;
pub mod publisher;
pub mod topology;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use connection::BrokerConnectionManager;
pub use consumer::{
    ConsumerHandle, DeliveryOutcome, HandlerError, LoggingNotificationHandler,
    NotificationHandler, TaskConsumer,
};
pub use mock::MockBroker;
pub use publisher::{NotificationPublisher, TaskPublisher};
pub use topology::{BrokerTopology, ExchangeType, Route};

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Broker operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Channel not initialized")]
    ChannelNotInitialized,

    #[error("Topology declaration failed: {0}")]
    Topology(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Properties attached to a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: String,
    /// Ask the broker to write the message to disk (AMQP delivery mode 2).
    pub persistent: bool,
}

impl MessageProperties {
    /// Persistent JSON message.
    pub fn persistent_json() -> Self {
        Self {
            content_type: "application/json".to_string(),
            persistent: true,
        }
    }
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message received from a queue, awaiting acknowledgement.
pub struct Delivery {
    pub routing_key: String,
    pub data: Vec<u8>,
    /// Set by the broker when this message was delivered before and not acked.
    pub redelivered: bool,
    acker: Box<dyn DeliveryAcker>,
}

impl Delivery {
    pub fn new(
        routing_key: impl Into<String>,
        data: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn DeliveryAcker>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            data,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("bytes", &self.data.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Opens network connections to the broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>>;
}

/// An open broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

/// A channel on an open connection.
///
/// Declarations are idempotent: redeclaring an entity with identical
/// arguments succeeds without creating a duplicate.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType, durable: bool) -> Result<()>;

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Hand a message to the broker. Returns once the channel accepted it;
    /// no publisher confirmation is awaited.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()>;

    /// Start a manual-acknowledgement consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;
}

// ============================================================================
// Factory
// ============================================================================

/// Build a connection manager for the configured broker.
///
/// The connection is not opened until the first `channel()` call.
#[cfg(feature = "amqp")]
pub fn init_connection_manager(config: &BrokerConfig) -> Arc<BrokerConnectionManager> {
    let connector = Arc::new(AmqpConnector::new(config));
    info!(
        host = %config.host,
        port = config.port,
        vhost = %config.vhost,
        "Broker connection manager initialized"
    );
    Arc::new(BrokerConnectionManager::new(
        connector,
        BrokerTopology::task_notifications(),
        config.connect_timeout(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistent_json_properties() {
        let props = MessageProperties::persistent_json();
        assert!(props.persistent);
        assert_eq!(props.content_type, "application/json");
    }
}
