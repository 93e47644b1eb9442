//! Exchange, queue and binding layout for task notifications.

use std::fmt;

use tracing::{debug, info};

use super::{BrokerChannel, BrokerError, Result};
use crate::task::OperationType;

/// Exchange receiving every task notification.
pub const TASK_EXCHANGE: &str = "task_notifications_exchange";

/// Broker exchange type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeType {
    Direct,
    Topic,
    Fanout,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Topic => "topic",
            Self::Fanout => "fanout",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue and routing key serving one operation type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub queue: String,
    pub routing_key: String,
}

impl Route {
    fn new(queue: &str, routing_key: &str) -> Self {
        Self {
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        }
    }
}

/// Static broker layout.
///
/// Holds exactly one route per operation type, so queues and routing keys
/// stay in 1:1 correspondence with CREATE/UPDATE/DELETE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTopology {
    pub exchange: String,
    pub exchange_type: ExchangeType,
    create: Route,
    update: Route,
    delete: Route,
}

impl BrokerTopology {
    /// The fixed task notification layout.
    pub fn task_notifications() -> Self {
        Self {
            exchange: TASK_EXCHANGE.to_string(),
            exchange_type: ExchangeType::Direct,
            create: Route::new("task_create_queue", "task.create"),
            update: Route::new("task_update_queue", "task.update"),
            delete: Route::new("task_delete_queue", "task.delete"),
        }
    }

    pub fn route(&self, operation: OperationType) -> &Route {
        match operation {
            OperationType::Create => &self.create,
            OperationType::Update => &self.update,
            OperationType::Delete => &self.delete,
        }
    }

    pub fn queue(&self, operation: OperationType) -> &str {
        &self.route(operation).queue
    }

    pub fn routing_key(&self, operation: OperationType) -> &str {
        &self.route(operation).routing_key
    }

    /// Routes in CREATE, UPDATE, DELETE order.
    pub fn routes(&self) -> impl Iterator<Item = (OperationType, &Route)> {
        OperationType::ALL
            .into_iter()
            .map(move |operation| (operation, self.route(operation)))
    }
}

impl Default for BrokerTopology {
    fn default() -> Self {
        Self::task_notifications()
    }
}

/// Declare the exchange, then every queue, then every binding.
///
/// Safe to call repeatedly; broker declarations are idempotent.
pub async fn declare(channel: &dyn BrokerChannel, topology: &BrokerTopology) -> Result<()> {
    channel
        .declare_exchange(&topology.exchange, topology.exchange_type, true)
        .await
        .map_err(|e| BrokerError::Topology(format!("exchange {}: {}", topology.exchange, e)))?;

    for (_, route) in topology.routes() {
        channel
            .declare_queue(&route.queue, true)
            .await
            .map_err(|e| BrokerError::Topology(format!("queue {}: {}", route.queue, e)))?;
    }

    for (operation, route) in topology.routes() {
        channel
            .bind_queue(&route.queue, &topology.exchange, &route.routing_key)
            .await
            .map_err(|e| BrokerError::Topology(format!("binding {}: {}", route.queue, e)))?;
        debug!(
            operation = %operation,
            queue = %route.queue,
            routing_key = %route.routing_key,
            "Bound queue to exchange"
        );
    }

    info!(
        exchange = %topology.exchange,
        exchange_type = %topology.exchange_type,
        "Topology declared"
    );
    Ok(())
}
