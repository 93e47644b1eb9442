//! AMQP (RabbitMQ) broker implementation.
//!
//! Thin adapter from the `BrokerConnector`/`BrokerChannel` traits onto lapin.
//! Connection and channel lifetime is owned by `BrokerConnectionManager`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    uri::{AMQPAuthority, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, info};

use super::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, Delivery, DeliveryAcker,
    DeliveryStream, ExchangeType, MessageProperties, Result,
};
use crate::config::BrokerConfig;

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// AMQP delivery mode for messages written to disk.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Opens lapin connections from broker configuration.
pub struct AmqpConnector {
    uri: AMQPUri,
    prefetch_count: u16,
}

impl AmqpConnector {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            uri: amqp_uri(config),
            prefetch_count: config.prefetch_count,
        }
    }
}

/// Build the connection URI without string formatting, so credentials and
/// vhost need no percent-encoding.
fn amqp_uri(config: &BrokerConfig) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.username.clone(),
                password: config.password.clone(),
            },
            host: config.host.clone(),
            port: config.port,
        },
        vhost: config.vhost.clone(),
        ..Default::default()
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        let connection = Connection::connect_uri(self.uri.clone(), ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Unavailable(format!("Failed to connect: {}", e)))?;

        info!(
            host = %self.uri.authority.host,
            port = self.uri.authority.port,
            vhost = %self.uri.vhost,
            "Connected to AMQP"
        );
        Ok(Arc::new(AmqpConnection {
            connection,
            prefetch_count: self.prefetch_count,
        }))
    }
}

struct AmqpConnection {
    connection: Connection,
    prefetch_count: u16,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Unavailable(format!("Failed to create channel: {}", e)))?;

        // Bounds the unacked backlog lapin buffers per consumer.
        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Unavailable(format!("Failed to set prefetch: {}", e)))?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "Bye")
            .await
            .map_err(|e| BrokerError::Unavailable(format!("Failed to close connection: {}", e)))
    }
}

struct AmqpChannel {
    channel: Channel,
}

fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Fanout => ExchangeKind::Fanout,
    }
}

fn basic_properties(properties: &MessageProperties) -> BasicProperties {
    let props = BasicProperties::default().with_content_type(properties.content_type.as_str().into());
    if properties.persistent {
        props.with_delivery_mode(DELIVERY_MODE_PERSISTENT)
    } else {
        props
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType, durable: bool) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to declare exchange: {}", e)))
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Topology(format!("Failed to declare queue: {}", e)))
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Topology(format!("Failed to bind queue: {}", e)))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        // The returned confirm is dropped: confirms are not enabled on this
        // channel, so there is nothing to wait for.
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                basic_properties(&properties),
            )
            .await
            .map(|_confirm| ())
            .map_err(|e| BrokerError::Publish(format!("Failed to publish: {}", e)))?;

        debug!(exchange = %exchange, routing_key = %routing_key, "Published message");
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to start consumer: {}", e)))?;

        let stream = consumer.map(|delivery| {
            delivery
                .map(|d| {
                    Delivery::new(
                        d.routing_key.as_str(),
                        d.data,
                        d.redelivered,
                        Box::new(AmqpAcker { acker: d.acker }),
                    )
                })
                .map_err(|e| BrokerError::Consume(e.to_string()))
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "Bye")
            .await
            .map_err(|e| BrokerError::Unavailable(format!("Failed to close channel: {}", e)))
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Ack(format!("Failed to ack: {}", e)))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Ack(format!("Failed to nack: {}", e)))
    }
}
