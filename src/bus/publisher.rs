//! Publishes task notifications on the notifications exchange.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{BrokerChannel, BrokerConnectionManager, BrokerError, MessageProperties, Result};
use crate::task::TaskNotificationMessage;

/// Sink for task notifications.
///
/// Implementations:
/// - `TaskPublisher`: broker exchange via the shared channel
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    async fn publish(&self, message: &TaskNotificationMessage, routing_key: &str) -> Result<()>;
}

/// Publishes notifications to the topology's exchange.
///
/// Messages are marked persistent but no broker confirmation is awaited: a
/// publish accepted by the local channel can still be lost if the connection
/// drops before the broker stores it. There is no retry queue or outbox.
pub struct TaskPublisher {
    manager: Arc<BrokerConnectionManager>,
    exchange: String,
    publish_timeout: Duration,
    channel: RwLock<Option<Arc<dyn BrokerChannel>>>,
}

impl TaskPublisher {
    pub fn new(manager: Arc<BrokerConnectionManager>, publish_timeout: Duration) -> Self {
        let exchange = manager.topology().exchange.clone();
        Self {
            manager,
            exchange,
            publish_timeout,
            channel: RwLock::new(None),
        }
    }

    /// Obtain the shared channel. Must succeed before `publish`.
    pub async fn connect(&self) -> Result<()> {
        let channel = self.manager.channel().await?;
        *self.channel.write().await = Some(channel);
        info!(exchange = %self.exchange, "Task publisher connected");
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.channel.read().await.is_some()
    }
}

#[async_trait]
impl NotificationPublisher for TaskPublisher {
    #[tracing::instrument(
        name = "bus.publish",
        skip_all,
        fields(operation = %message.operation(), task_id = message.task_id(), routing_key = %routing_key)
    )]
    async fn publish(&self, message: &TaskNotificationMessage, routing_key: &str) -> Result<()> {
        let channel = self
            .channel
            .read()
            .await
            .clone()
            .ok_or(BrokerError::ChannelNotInitialized)?;

        let payload = serde_json::to_vec(message)?;
        let publish = channel.publish(
            &self.exchange,
            routing_key,
            payload,
            MessageProperties::persistent_json(),
        );

        match tokio::time::timeout(self.publish_timeout, publish).await {
            Ok(Ok(())) => {
                debug!(exchange = %self.exchange, "Published task notification");
                Ok(())
            }
            Ok(Err(e)) => Err(BrokerError::Unavailable(e.to_string())),
            Err(_) => Err(BrokerError::Unavailable(
                BrokerError::Timeout(self.publish_timeout).to_string(),
            )),
        }
    }
}
