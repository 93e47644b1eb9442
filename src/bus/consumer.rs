//! Consumes task notifications from every topology queue.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn, Instrument};

use super::{BrokerConnectionManager, Delivery, DeliveryStream, Result};
use crate::task::TaskNotificationMessage;

/// Error returned by a notification handler.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Handler for notifications received from the broker.
pub trait NotificationHandler: Send + Sync {
    fn handle(
        &self,
        message: TaskNotificationMessage,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handler succeeded.
    Acked,
    /// Handler failed on first delivery; returned to the queue.
    Requeued,
    /// Handler failed again after redelivery, or the payload was not a
    /// notification. Dead-lettered if the broker has a policy, else dropped.
    Rejected,
}

/// Subscribes a handler to the create, update and delete queues.
pub struct TaskConsumer {
    manager: Arc<BrokerConnectionManager>,
    consumer_tag_prefix: String,
}

impl TaskConsumer {
    pub fn new(manager: Arc<BrokerConnectionManager>, consumer_tag_prefix: impl Into<String>) -> Self {
        Self {
            manager,
            consumer_tag_prefix: consumer_tag_prefix.into(),
        }
    }

    /// Start one manual-ack consumer per queue, each on its own task.
    ///
    /// Messages of one queue are processed sequentially in delivery order;
    /// queues are independent of each other.
    pub async fn consume(&self, handler: Arc<dyn NotificationHandler>) -> Result<ConsumerHandle> {
        let channel = self.manager.channel().await?;
        let topology = self.manager.topology();

        let mut tasks = Vec::new();
        for (operation, route) in topology.routes() {
            let tag = format!("{}-{}", self.consumer_tag_prefix, route.queue);
            let stream = channel.consume(&route.queue, &tag).await?;
            info!(
                queue = %route.queue,
                operation = %operation,
                consumer_tag = %tag,
                "Consumer started"
            );

            let span = tracing::info_span!("bus.consume", queue = %route.queue);
            let queue = route.queue.clone();
            let handler = Arc::clone(&handler);
            tasks.push(tokio::spawn(
                run_consumer(queue, stream, handler).instrument(span),
            ));
        }

        Ok(ConsumerHandle { tasks })
    }
}

async fn run_consumer(
    queue: String,
    mut stream: DeliveryStream,
    handler: Arc<dyn NotificationHandler>,
) {
    while let Some(delivery) = stream.next().await {
        match delivery {
            Ok(delivery) => {
                process_delivery(delivery, handler.as_ref()).await;
            }
            Err(e) => {
                error!(queue = %queue, error = %e, "Consumer delivery error, stopping");
                break;
            }
        }
    }
    warn!(queue = %queue, "Consumer stream ended");
}

/// Decode, handle and settle a single delivery.
///
/// Acks only after the handler completes without error. Handler errors and
/// panics are contained here so the consume loop keeps going.
pub async fn process_delivery(
    delivery: Delivery,
    handler: &dyn NotificationHandler,
) -> DeliveryOutcome {
    let message: TaskNotificationMessage = match serde_json::from_slice(&delivery.data) {
        Ok(message) => message,
        Err(e) => {
            error!(
                routing_key = %delivery.routing_key,
                error = %e,
                "Failed to decode task notification"
            );
            // Malformed payloads are never requeued.
            settle(delivery.nack(false).await);
            return DeliveryOutcome::Rejected;
        }
    };

    debug!(
        routing_key = %delivery.routing_key,
        operation = %message.operation(),
        task_id = message.task_id(),
        "Received task notification"
    );

    // `handle` itself may panic before handing back its future.
    let result = AssertUnwindSafe(async move { handler.handle(message).await })
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(HandlerError::new("handler panicked")));

    match result {
        Ok(()) => {
            settle(delivery.ack().await);
            DeliveryOutcome::Acked
        }
        Err(e) if !delivery.redelivered => {
            warn!(
                routing_key = %delivery.routing_key,
                error = %e,
                "Handler failed, requeueing"
            );
            settle(delivery.nack(true).await);
            DeliveryOutcome::Requeued
        }
        Err(e) => {
            error!(
                routing_key = %delivery.routing_key,
                error = %e,
                "Handler failed on redelivery, rejecting"
            );
            settle(delivery.nack(false).await);
            DeliveryOutcome::Rejected
        }
    }
}

fn settle(result: Result<()>) {
    if let Err(e) = result {
        error!(error = %e, "Failed to settle delivery");
    }
}

/// Running consumer loops.
pub struct ConsumerHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl ConsumerHandle {
    pub fn consumer_count(&self) -> usize {
        self.tasks.len()
    }

    /// Resolve when any consumer loop stops on its own.
    ///
    /// A loop stops when its delivery stream errors or ends, for example
    /// after the broker connection drops. A panicked loop surfaces as the
    /// `JoinError`. Resolves immediately when there are no consumers.
    pub async fn wait(&mut self) -> std::result::Result<(), JoinError> {
        if self.tasks.is_empty() {
            return Ok(());
        }
        let (result, index, _) = futures::future::select_all(self.tasks.iter_mut()).await;
        self.tasks.swap_remove(index);
        result
    }

    /// Stop every consumer loop.
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        info!(consumers = self.tasks.len(), "Consumers stopped");
    }
}

/// Writes every notification to the structured log.
#[derive(Debug, Default, Clone)]
pub struct LoggingNotificationHandler;

impl NotificationHandler for LoggingNotificationHandler {
    fn handle(
        &self,
        message: TaskNotificationMessage,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        Box::pin(async move {
            info!(
                service = "NotificationService",
                operation = %message.operation(),
                task_id = message.task_id(),
                title = message.payload().map(|t| t.title.as_str()).unwrap_or(""),
                timestamp = %message.timestamp(),
                "Task notification"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BrokerTopology, MessageProperties, MockBroker};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct RecordingHandler {
        tx: mpsc::UnboundedSender<TaskNotificationMessage>,
    }

    impl NotificationHandler for RecordingHandler {
        fn handle(
            &self,
            message: TaskNotificationMessage,
        ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
            let tx = self.tx.clone();
            Box::pin(async move {
                let _ = tx.send(message);
                Ok(())
            })
        }
    }

    /// Fails the first `failures` calls, then succeeds.
    struct FlakyHandler {
        calls: Arc<AtomicUsize>,
        failures: usize,
    }

    impl NotificationHandler for FlakyHandler {
        fn handle(
            &self,
            _message: TaskNotificationMessage,
        ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let failures = self.failures;
            Box::pin(async move {
                if call < failures {
                    Err(HandlerError::new("sink offline"))
                } else {
                    Ok(())
                }
            })
        }
    }

    struct PanickingHandler;

    impl NotificationHandler for PanickingHandler {
        fn handle(
            &self,
            _message: TaskNotificationMessage,
        ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
            Box::pin(async move {
                let fail = true;
                if fail {
                    panic!("boom");
                }
                Ok(())
            })
        }
    }

    /// Panics on its first call before returning a future, then succeeds.
    struct EagerPanicHandler {
        calls: Arc<AtomicUsize>,
    }

    impl NotificationHandler for EagerPanicHandler {
        fn handle(
            &self,
            _message: TaskNotificationMessage,
        ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("handler setup failed");
            }
            Box::pin(async { Ok(()) })
        }
    }

    fn manager(broker: &MockBroker) -> Arc<BrokerConnectionManager> {
        Arc::new(BrokerConnectionManager::new(
            Arc::new(broker.clone()),
            BrokerTopology::task_notifications(),
            Duration::from_secs(5),
        ))
    }

    async fn publish_raw(manager: &BrokerConnectionManager, routing_key: &str, payload: Vec<u8>) {
        manager
            .channel()
            .await
            .unwrap()
            .publish(
                "task_notifications_exchange",
                routing_key,
                payload,
                MessageProperties::persistent_json(),
            )
            .await
            .unwrap();
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn message_bytes(message: &TaskNotificationMessage) -> Vec<u8> {
        serde_json::to_vec(message).unwrap()
    }

    #[tokio::test]
    async fn test_consume_starts_one_consumer_per_queue() {
        let broker = MockBroker::new();
        let consumer = TaskConsumer::new(manager(&broker), "test");
        let (tx, _rx) = mpsc::unbounded_channel();

        let handle = consumer
            .consume(Arc::new(RecordingHandler { tx }))
            .await
            .unwrap();

        assert_eq!(handle.consumer_count(), 3);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_successful_handler_acks() {
        let broker = MockBroker::new();
        let manager = manager(&broker);
        let consumer = TaskConsumer::new(Arc::clone(&manager), "test");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = consumer
            .consume(Arc::new(RecordingHandler { tx }))
            .await
            .unwrap();

        publish_raw(
            &manager,
            "task.delete",
            message_bytes(&TaskNotificationMessage::deleted(11)),
        )
        .await;

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(received.task_id(), 11);

        let b = broker.clone();
        wait_for(move || {
            let b = b.clone();
            async move { b.acked_count().await == 1 }
        })
        .await;
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_failed_handler_requeues_then_acks_on_success() {
        let broker = MockBroker::new();
        let manager = manager(&broker);
        let consumer = TaskConsumer::new(Arc::clone(&manager), "test");
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = consumer
            .consume(Arc::new(FlakyHandler {
                calls: Arc::clone(&calls),
                failures: 1,
            }))
            .await
            .unwrap();

        publish_raw(
            &manager,
            "task.delete",
            message_bytes(&TaskNotificationMessage::deleted(4)),
        )
        .await;

        let b = broker.clone();
        wait_for(move || {
            let b = b.clone();
            async move { b.acked_count().await == 1 }
        })
        .await;
        assert_eq!(broker.requeued_count().await, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_repeated_failure_rejects_without_requeue() {
        let broker = MockBroker::new();
        let manager = manager(&broker);
        let consumer = TaskConsumer::new(Arc::clone(&manager), "test");
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = consumer
            .consume(Arc::new(FlakyHandler {
                calls: Arc::clone(&calls),
                failures: usize::MAX,
            }))
            .await
            .unwrap();

        publish_raw(
            &manager,
            "task.delete",
            message_bytes(&TaskNotificationMessage::deleted(4)),
        )
        .await;

        let b = broker.clone();
        wait_for(move || {
            let b = b.clone();
            async move { b.rejected().await.len() == 1 }
        })
        .await;
        assert_eq!(broker.acked_count().await, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_payload_rejected_and_loop_continues() {
        let broker = MockBroker::new();
        let manager = manager(&broker);
        let consumer = TaskConsumer::new(Arc::clone(&manager), "test");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = consumer
            .consume(Arc::new(RecordingHandler { tx }))
            .await
            .unwrap();

        publish_raw(&manager, "task.create", b"not json".to_vec()).await;
        publish_raw(
            &manager,
            "task.create",
            message_bytes(&TaskNotificationMessage::deleted(8)),
        )
        .await;

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(received.task_id(), 8);
        assert_eq!(broker.rejected().await, vec![b"not json".to_vec()]);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let broker = MockBroker::new();
        let manager = manager(&broker);
        manager.channel().await.unwrap();

        publish_raw(
            &manager,
            "task.update",
            message_bytes(&TaskNotificationMessage::deleted(1)),
        )
        .await;
        let mut stream = manager
            .channel()
            .await
            .unwrap()
            .consume("task_update_queue", "direct")
            .await
            .unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        let outcome = process_delivery(delivery, &PanickingHandler).await;

        assert_eq!(outcome, DeliveryOutcome::Requeued);
    }

    #[tokio::test]
    async fn test_handler_panicking_before_its_future_keeps_loop_running() {
        let broker = MockBroker::new();
        let manager = manager(&broker);
        let consumer = TaskConsumer::new(Arc::clone(&manager), "test");
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = consumer
            .consume(Arc::new(EagerPanicHandler {
                calls: Arc::clone(&calls),
            }))
            .await
            .unwrap();

        for id in [21, 22] {
            publish_raw(
                &manager,
                "task.delete",
                message_bytes(&TaskNotificationMessage::deleted(id)),
            )
            .await;
        }

        let b = broker.clone();
        wait_for(move || {
            let b = b.clone();
            async move { b.acked_count().await == 2 }
        })
        .await;
        assert_eq!(broker.requeued_count().await, 1);
        assert!(broker.rejected().await.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_wait_resolves_when_streams_end() {
        let broker = MockBroker::new();
        let manager = manager(&broker);
        let consumer = TaskConsumer::new(Arc::clone(&manager), "test");
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut handle = consumer
            .consume(Arc::new(RecordingHandler { tx }))
            .await
            .unwrap();

        // Closing the channel cancels every consumer.
        manager.close().await;

        let result = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("consumer loop did not stop");
        assert!(result.is_ok());
        assert_eq!(handle.consumer_count(), 2);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_wait_reports_aborted_loop() {
        let mut handle = ConsumerHandle {
            tasks: vec![tokio::spawn(std::future::pending::<()>())],
        };
        handle.tasks[0].abort();

        let result = handle.wait().await;

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(handle.consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_without_consumers_returns_immediately() {
        let mut handle = ConsumerHandle { tasks: Vec::new() };
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_logging_handler_succeeds() {
        let result = LoggingNotificationHandler
            .handle(TaskNotificationMessage::deleted(2))
            .await;
        assert!(result.is_ok());
    }
}
