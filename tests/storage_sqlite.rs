//! SQLite repository integration tests.
//!
//! Run with: cargo test --test storage_sqlite --features sqlite
//!
//! Uses in-memory and temporary-file databases; no external services.

use std::sync::Arc;
use std::time::Duration;

use taskline::bus::{BrokerConnectionManager, BrokerTopology, MockBroker, TaskPublisher};
use taskline::cache::{CacheGateway, MockCacheStore, DEFAULT_TTL};
use taskline::config::{DatabaseConfig, DatabaseType, PoolConfig};
use taskline::services::{TaskError, TaskService};
use taskline::storage::{init_storage, SqliteTaskRepository, TaskRepository};
use taskline::task::{NewTask, TaskChanges, TaskPriority, TaskStatus};

async fn memory_repo() -> Arc<SqliteTaskRepository> {
    let repo = SqliteTaskRepository::in_memory()
        .await
        .expect("in-memory sqlite");
    repo.init().await.expect("schema");
    Arc::new(repo)
}

async fn service(repo: Arc<dyn TaskRepository>) -> (TaskService, MockBroker) {
    let broker = MockBroker::new();
    let manager = Arc::new(BrokerConnectionManager::new(
        Arc::new(broker.clone()),
        BrokerTopology::task_notifications(),
        Duration::from_secs(5),
    ));
    let publisher = TaskPublisher::new(manager, Duration::from_secs(5));
    publisher.connect().await.expect("publisher connect");

    let service = TaskService::new(
        repo,
        CacheGateway::new(Arc::new(MockCacheStore::new()), DEFAULT_TTL),
        Arc::new(publisher),
        BrokerTopology::task_notifications(),
    );
    (service, broker)
}

#[tokio::test]
async fn test_service_lifecycle_on_sqlite() {
    let repo = memory_repo().await;
    let (service, broker) = service(repo.clone()).await;

    let task = service
        .create_task(
            NewTask::new("Migrate database")
                .with_description("move to sqlite")
                .with_priority(TaskPriority::High),
        )
        .await
        .unwrap();
    assert_eq!(task.priority, TaskPriority::High);
    assert_eq!(task.status, TaskStatus::Pending);

    let updated = service
        .update_task(
            task.id,
            TaskChanges {
                status: Some(TaskStatus::InProgress),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.status, TaskStatus::InProgress);
    assert_eq!(updated.description.as_deref(), Some("move to sqlite"));

    service.delete_task(task.id).await.unwrap();
    assert_eq!(
        service.get_task(task.id).await,
        Err(TaskError::NotFound(task.id))
    );
    assert!(repo.find_all().await.unwrap().is_empty());

    let keys: Vec<String> = broker
        .published()
        .await
        .into_iter()
        .map(|m| m.routing_key)
        .collect();
    assert_eq!(keys, vec!["task.create", "task.update", "task.delete"]);
}

#[tokio::test]
async fn test_bulk_create_is_all_or_nothing_on_sqlite() {
    let repo = memory_repo().await;
    let (service, broker) = service(repo.clone()).await;

    let ack = service
        .bulk_create_tasks(vec![
            NewTask::new("First bulk"),
            NewTask::new("Second bulk"),
            NewTask::new("Third bulk"),
        ])
        .await
        .unwrap();
    assert_eq!(ack.affected, 3);
    assert_eq!(repo.find_all().await.unwrap().len(), 3);
    assert_eq!(broker.published_with_key("task.create").await.len(), 3);

    let result = service
        .bulk_create_tasks(vec![NewTask::new("Fine"), NewTask::new("  ")])
        .await;
    assert!(matches!(result, Err(TaskError::ValidationFailure(_))));
    assert_eq!(repo.find_all().await.unwrap().len(), 3);
    assert_eq!(broker.published().await.len(), 3);
}

#[tokio::test]
async fn test_update_of_soft_deleted_task_is_not_found() {
    let repo = memory_repo().await;
    let (service, _broker) = service(repo).await;
    let task = service
        .create_task(NewTask::new("Short lived"))
        .await
        .unwrap();
    service.delete_task(task.id).await.unwrap();

    let result = service
        .update_task(
            task.id,
            TaskChanges {
                title: Some("Resurrected".to_string()),
                ..Default::default()
            },
        )
        .await;

    assert_eq!(
        result,
        Err(TaskError::ValidationFailure("Task not found".to_string()))
    );
}

#[tokio::test]
async fn test_file_database_persists_across_pools() {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig {
        database_type: DatabaseType::Sqlite,
        path: dir.path().join("tasks.db").to_string_lossy().into_owned(),
        pool: PoolConfig {
            max: 2,
            ..Default::default()
        },
    };

    {
        let repo = init_storage(&config).await.unwrap();
        let (service, _broker) = service(repo).await;
        service
            .create_task(NewTask::new("Durable task"))
            .await
            .unwrap();
    }

    let repo = init_storage(&config).await.unwrap();
    let tasks = repo.find_all().await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].title, "Durable task");
}
