//! In-memory broker for tests and standalone runs.
//!
//! Emulates the parts of an AMQP broker the pipeline relies on: durable
//! declarations with redeclare checks, direct-exchange routing, per-queue
//! buffering, manual acknowledgement with requeue, and a record of every
//! published message.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, Delivery, DeliveryAcker,
    DeliveryStream, ExchangeType, MessageProperties, Result,
};

/// A message as it was handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

impl PublishedMessage {
    /// Decode the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    routing_key: String,
    data: Vec<u8>,
    redelivered: bool,
}

struct QueueState {
    durable: bool,
    messages: VecDeque<QueuedMessage>,
    consumers: Vec<mpsc::UnboundedSender<Result<Delivery>>>,
    next_consumer: usize,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, (ExchangeType, bool)>,
    queues: BTreeMap<String, QueueState>,
    /// (exchange, routing_key, queue)
    bindings: BTreeSet<(String, String, String)>,
    published: Vec<PublishedMessage>,
    acked: usize,
    requeued: usize,
    rejected: Vec<Vec<u8>>,
    close_log: Vec<&'static str>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<BrokerState>,
    connects: AtomicUsize,
    channels_opened: AtomicUsize,
    fail_on_connect: AtomicBool,
    fail_on_publish: AtomicBool,
}

/// In-memory broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct MockBroker {
    inner: Arc<Inner>,
    connect_delay: Option<Duration>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every connect, to widen race windows in tests.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn set_fail_on_connect(&self, fail: bool) {
        self.inner.fail_on_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_on_publish(&self, fail: bool) {
        self.inner.fail_on_publish.store(fail, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn channel_open_count(&self) -> usize {
        self.inner.channels_opened.load(Ordering::SeqCst)
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.inner.state.lock().await.published.clone()
    }

    pub async fn published_with_key(&self, routing_key: &str) -> Vec<PublishedMessage> {
        self.inner
            .state
            .lock()
            .await
            .published
            .iter()
            .filter(|m| m.routing_key == routing_key)
            .cloned()
            .collect()
    }

    pub async fn exchange_type(&self, name: &str) -> Option<ExchangeType> {
        self.inner
            .state
            .lock()
            .await
            .exchanges
            .get(name)
            .map(|(kind, _)| *kind)
    }

    pub async fn queue_names(&self) -> Vec<String> {
        self.inner.state.lock().await.queues.keys().cloned().collect()
    }

    pub async fn binding_count(&self) -> usize {
        self.inner.state.lock().await.bindings.len()
    }

    /// Messages waiting in a queue (not yet handed to a consumer).
    pub async fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    pub async fn acked_count(&self) -> usize {
        self.inner.state.lock().await.acked
    }

    pub async fn requeued_count(&self) -> usize {
        self.inner.state.lock().await.requeued
    }

    /// Payloads rejected without requeue.
    pub async fn rejected(&self) -> Vec<Vec<u8>> {
        self.inner.state.lock().await.rejected.clone()
    }

    /// Order in which channels and connections were closed.
    pub async fn close_log(&self) -> Vec<&'static str> {
        self.inner.state.lock().await.close_log.clone()
    }
}

#[async_trait]
impl BrokerConnector for MockBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.inner.fail_on_connect.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable(
                "Mock connection refused".to_string(),
            ));
        }
        Ok(Arc::new(MockConnection {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MockConnection {
    inner: Arc<Inner>,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.inner.channels_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockChannel {
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.inner.state.lock().await.close_log.push("connection");
        Ok(())
    }
}

struct MockChannel {
    inner: Arc<Inner>,
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeType, durable: bool) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        match state.exchanges.get(name) {
            Some(existing) if *existing != (kind, durable) => Err(BrokerError::Topology(format!(
                "PRECONDITION_FAILED - exchange {} redeclared with different arguments",
                name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), (kind, durable));
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        match state.queues.get(name) {
            Some(existing) if existing.durable != durable => Err(BrokerError::Topology(format!(
                "PRECONDITION_FAILED - queue {} redeclared with different durability",
                name
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    name.to_string(),
                    QueueState {
                        durable,
                        messages: VecDeque::new(),
                        consumers: Vec::new(),
                        next_consumer: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::Topology(format!(
                "NOT_FOUND - no exchange {}",
                exchange
            )));
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::Topology(format!("NOT_FOUND - no queue {}", queue)));
        }
        state.bindings.insert((
            exchange.to_string(),
            routing_key.to_string(),
            queue.to_string(),
        ));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        if self.inner.fail_on_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Publish("Mock publish failure".to_string()));
        }

        let mut state = self.inner.state.lock().await;
        let kind = match state.exchanges.get(exchange) {
            Some((kind, _)) => *kind,
            None => {
                return Err(BrokerError::Publish(format!(
                    "NOT_FOUND - no exchange {}",
                    exchange
                )))
            }
        };

        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.clone(),
            properties,
        });

        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|(ex, key, _)| {
                ex == exchange && (kind == ExchangeType::Fanout || key == routing_key)
            })
            .map(|(_, _, queue)| queue.clone())
            .collect();

        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.messages.push_back(QueuedMessage {
                    routing_key: routing_key.to_string(),
                    data: payload.clone(),
                    redelivered: false,
                });
            }
            dispatch(&self.inner, &mut state, &queue);
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.inner.state.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();
        match state.queues.get_mut(queue) {
            Some(q) => q.consumers.push(tx),
            None => return Err(BrokerError::Consume(format!("NOT_FOUND - no queue {}", queue))),
        }
        dispatch(&self.inner, &mut state, queue);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        // Closing a channel cancels its consumers, ending their streams.
        for q in state.queues.values_mut() {
            q.consumers.clear();
        }
        state.close_log.push("channel");
        Ok(())
    }
}

/// Hand buffered messages of `queue` to its consumers, round-robin.
fn dispatch(inner: &Arc<Inner>, state: &mut BrokerState, queue: &str) {
    let Some(q) = state.queues.get_mut(queue) else {
        return;
    };
    while !q.consumers.is_empty() {
        let Some(message) = q.messages.pop_front() else {
            break;
        };
        let idx = q.next_consumer % q.consumers.len();
        let delivery = Delivery::new(
            message.routing_key.clone(),
            message.data.clone(),
            message.redelivered,
            Box::new(MockAcker {
                inner: Arc::clone(inner),
                queue: queue.to_string(),
                message: message.clone(),
                settled: AtomicBool::new(false),
            }),
        );
        if q.consumers[idx].send(Ok(delivery)).is_err() {
            q.consumers.remove(idx);
            q.messages.push_front(message);
        } else {
            q.next_consumer = q.next_consumer.wrapping_add(1);
        }
    }
}

struct MockAcker {
    inner: Arc<Inner>,
    queue: String,
    message: QueuedMessage,
    settled: AtomicBool,
}

impl MockAcker {
    fn settle(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Ack("PRECONDITION_FAILED - unknown delivery tag".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryAcker for MockAcker {
    async fn ack(&self) -> Result<()> {
        self.settle()?;
        self.inner.state.lock().await.acked += 1;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle()?;
        let mut state = self.inner.state.lock().await;
        if requeue {
            state.requeued += 1;
            if let Some(q) = state.queues.get_mut(&self.queue) {
                q.messages.push_front(QueuedMessage {
                    redelivered: true,
                    ..self.message.clone()
                });
            }
            dispatch(&self.inner, &mut state, &self.queue);
        } else {
            state.rejected.push(self.message.data.clone());
        }
        Ok(())
    }
}
