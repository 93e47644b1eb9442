//! End-to-end pipeline tests against the in-memory broker, cache and
//! repository.
//!
//! Run with: cargo test --test pipeline

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use taskline::bus::topology;
use taskline::bus::{
    BrokerConnectionManager, BrokerTopology, HandlerError, MockBroker, NotificationHandler,
    TaskConsumer, TaskPublisher,
};
use taskline::cache::{task_key, CacheGateway, MockCacheStore, ALL_TASKS_KEY, DEFAULT_TTL};
use taskline::services::{TaskError, TaskService};
use taskline::storage::MockTaskRepository;
use taskline::task::{NewTask, OperationType, Task, TaskNotificationMessage, TaskStatus};

struct Pipeline {
    service: TaskService,
    manager: Arc<BrokerConnectionManager>,
    broker: MockBroker,
    cache: Arc<MockCacheStore>,
    gateway: CacheGateway,
    repo: Arc<MockTaskRepository>,
}

async fn pipeline() -> Pipeline {
    let broker = MockBroker::new();
    let manager = Arc::new(BrokerConnectionManager::new(
        Arc::new(broker.clone()),
        BrokerTopology::task_notifications(),
        Duration::from_secs(5),
    ));
    let publisher = TaskPublisher::new(Arc::clone(&manager), Duration::from_secs(5));
    publisher.connect().await.expect("publisher connect");

    let repo = Arc::new(MockTaskRepository::new());
    let cache = Arc::new(MockCacheStore::new());
    let gateway = CacheGateway::new(cache.clone(), DEFAULT_TTL);

    let service = TaskService::new(
        repo.clone(),
        gateway.clone(),
        Arc::new(publisher),
        BrokerTopology::task_notifications(),
    );

    Pipeline {
        service,
        manager,
        broker,
        cache,
        gateway,
        repo,
    }
}

fn decode(payload: &taskline::bus::mock::PublishedMessage) -> TaskNotificationMessage {
    payload.json().expect("notification json")
}

struct ForwardingHandler {
    tx: mpsc::UnboundedSender<TaskNotificationMessage>,
}

impl NotificationHandler for ForwardingHandler {
    fn handle(
        &self,
        message: TaskNotificationMessage,
    ) -> BoxFuture<'static, Result<(), HandlerError>> {
        let tx = self.tx.clone();
        Box::pin(async move {
            tx.send(message)
                .map_err(|_| HandlerError::new("receiver dropped"))
        })
    }
}

#[tokio::test]
async fn test_create_publishes_exactly_one_create_notification() {
    let p = pipeline().await;

    let task = p
        .service
        .create_task(NewTask::new("Ship release"))
        .await
        .unwrap();

    let published = p.broker.published().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].routing_key, "task.create");
    assert_eq!(published[0].exchange, "task_notifications_exchange");

    let message = decode(&published[0]);
    assert_eq!(message.operation(), OperationType::Create);
    assert_eq!(message.task_id(), task.id);
    assert_eq!(message.payload(), Some(&task));
}

#[tokio::test]
async fn test_wire_format_uses_type_and_camel_case() {
    let p = pipeline().await;
    p.service
        .create_task(NewTask::new("Ship release"))
        .await
        .unwrap();

    let published = p.broker.published().await;
    let json: serde_json::Value = serde_json::from_slice(&published[0].payload).unwrap();

    assert_eq!(json["type"], "CREATE");
    assert_eq!(json["taskId"], 1);
    assert_eq!(json["payload"]["status"], "PENDING");
    assert_eq!(json["payload"]["priority"], "LOW");
    assert!(json["payload"]["createdAt"].is_string());
    assert!(json["payload"].get("deletedAt").is_none());
    assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
}

#[tokio::test]
async fn test_concurrent_first_channel_calls_share_one_connection() {
    let broker = MockBroker::new().with_connect_delay(Duration::from_millis(20));
    let manager = Arc::new(BrokerConnectionManager::new(
        Arc::new(broker.clone()),
        BrokerTopology::task_notifications(),
        Duration::from_secs(5),
    ));

    let calls: Vec<_> = (0..12)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.channel().await })
        })
        .collect();

    let mut channels = Vec::new();
    for call in calls {
        channels.push(call.await.unwrap().unwrap());
    }

    assert_eq!(broker.connect_count(), 1);
    assert_eq!(broker.channel_open_count(), 1);
    assert!(channels.iter().all(|c| Arc::ptr_eq(c, &channels[0])));
}

#[tokio::test]
async fn test_redeclaring_topology_creates_no_duplicates() {
    let p = pipeline().await;
    let channel = p.manager.channel().await.unwrap();

    topology::declare(channel.as_ref(), p.manager.topology())
        .await
        .unwrap();
    topology::declare(channel.as_ref(), p.manager.topology())
        .await
        .unwrap();

    let mut queues = p.broker.queue_names().await;
    queues.sort();
    assert_eq!(
        queues,
        vec![
            "task_create_queue",
            "task_delete_queue",
            "task_update_queue"
        ]
    );
    assert_eq!(p.broker.binding_count().await, 3);
}

#[tokio::test]
async fn test_cache_round_trip() {
    let p = pipeline().await;
    let task = p
        .service
        .create_task(NewTask::new("Cache me"))
        .await
        .unwrap();

    p.gateway
        .set(&task_key(1), &task, Some(Duration::from_secs(60)))
        .await
        .unwrap();
    let cached: Option<Task> = p.gateway.get(&task_key(1)).await.unwrap();
    assert_eq!(cached, Some(task));

    p.gateway.del(&task_key(1)).await.unwrap();
    let cached: Option<Task> = p.gateway.get(&task_key(1)).await.unwrap();
    assert_eq!(cached, None);
}

#[tokio::test]
async fn test_delete_removes_row_cache_entry_and_publishes_once() {
    let p = pipeline().await;
    for i in 1..=7 {
        p.service
            .create_task(NewTask::new(format!("Task number {}", i)))
            .await
            .unwrap();
    }
    p.service.get_task(7).await.unwrap();
    assert!(p.cache.raw(&task_key(7)).await.is_some());

    let ack = p.service.delete_task(7).await.unwrap();

    assert_eq!(ack.message, "Task deleted successfully");
    assert_eq!(p.service.get_task(7).await, Err(TaskError::NotFound(7)));
    assert!(p.cache.raw(&task_key(7)).await.is_none());
    assert!(p.repo.row(7).await.unwrap().deleted_at.is_some());

    let deletes = p.broker.published_with_key("task.delete").await;
    assert_eq!(deletes.len(), 1);
    let message = decode(&deletes[0]);
    assert_eq!(message.operation(), OperationType::Delete);
    assert_eq!(message.task_id(), 7);
    assert!(message.payload().is_none());

    let json: serde_json::Value = serde_json::from_slice(&deletes[0].payload).unwrap();
    assert!(json.get("payload").is_none());
}

#[tokio::test]
async fn test_read_one_cache_hit_skips_repository() {
    let p = pipeline().await;
    let task = p
        .service
        .create_task(NewTask::new("Hot task"))
        .await
        .unwrap();

    // Miss: one repository read, then the entry is cached.
    p.service.get_task(task.id).await.unwrap();
    assert_eq!(p.repo.find_by_pk_count(), 1);
    assert!(p.cache.raw(&task_key(task.id)).await.is_some());

    // Hit: no further repository reads.
    let cached = p.service.get_task(task.id).await.unwrap();
    assert_eq!(cached, task);
    assert_eq!(p.repo.find_by_pk_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_read_one_after_expiry_reads_repository_once_and_repopulates() {
    let p = pipeline().await;
    let task = p
        .service
        .create_task(NewTask::new("Cooling task"))
        .await
        .unwrap();
    p.service.get_task(task.id).await.unwrap();
    assert_eq!(p.repo.find_by_pk_count(), 1);

    tokio::time::advance(DEFAULT_TTL + Duration::from_secs(1)).await;
    assert!(p.cache.raw(&task_key(task.id)).await.is_none());

    p.service.get_task(task.id).await.unwrap();

    assert_eq!(p.repo.find_by_pk_count(), 2);
    assert!(p.cache.raw(&task_key(task.id)).await.is_some());
}

#[tokio::test]
async fn test_read_all_uses_cache_until_invalidated() {
    let p = pipeline().await;
    p.service
        .create_task(NewTask::new("First task"))
        .await
        .unwrap();

    assert_eq!(p.service.get_all_tasks().await.unwrap().len(), 1);
    assert_eq!(p.service.get_all_tasks().await.unwrap().len(), 1);
    assert_eq!(p.repo.find_all_count(), 1);
    assert!(p.cache.raw(ALL_TASKS_KEY).await.is_some());

    p.service
        .create_task(NewTask::new("Second task"))
        .await
        .unwrap();

    assert_eq!(p.service.get_all_tasks().await.unwrap().len(), 2);
    assert_eq!(p.repo.find_all_count(), 2);
}

#[tokio::test]
async fn test_bulk_create_with_invalid_row_persists_and_publishes_nothing() {
    let p = pipeline().await;

    let result = p
        .service
        .bulk_create_tasks(vec![
            NewTask::new("Valid task"),
            NewTask::new("x"),
            NewTask::new("Another valid task"),
        ])
        .await;

    match result {
        Err(TaskError::ValidationFailure(msg)) => assert!(msg.contains("index 1")),
        other => panic!("expected ValidationFailure, got {:?}", other),
    }
    assert_eq!(p.repo.row_count().await, 0);
    assert!(p.broker.published().await.is_empty());
}

#[tokio::test]
async fn test_notifications_reach_consumer_handler() {
    let p = pipeline().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumer = TaskConsumer::new(Arc::clone(&p.manager), "pipeline");
    let handle = consumer
        .consume(Arc::new(ForwardingHandler { tx }))
        .await
        .unwrap();

    let task = p
        .service
        .create_task(NewTask::new("Observe me"))
        .await
        .unwrap();
    p.service
        .update_task(
            task.id,
            taskline::task::TaskChanges {
                status: Some(TaskStatus::Completed),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    p.service.delete_task(task.id).await.unwrap();

    let mut operations = Vec::new();
    for _ in 0..3 {
        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("notification in time")
            .expect("channel open");
        assert_eq!(message.task_id(), task.id);
        operations.push(message.operation());
    }
    operations.sort();
    assert_eq!(
        operations,
        vec![
            OperationType::Create,
            OperationType::Update,
            OperationType::Delete
        ]
    );

    handle.shutdown();
    p.manager.close().await;
    assert_eq!(p.broker.close_log().await, vec!["channel", "connection"]);
}
