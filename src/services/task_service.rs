//! Task mutations and cached reads.
//!
//! Every write runs as: transaction, commit, cache invalidation, then
//! notification. A notification is never published for a write that did not
//! commit. Cache and broker failures after commit are logged and do not fail
//! the request.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::bus::{BrokerError, BrokerTopology, NotificationPublisher};
use crate::cache::{task_key, CacheError, CacheGateway, ALL_TASKS_KEY};
use crate::storage::{StorageError, TaskRepository, TaskTransaction};
use crate::task::{
    NewTask, Task, TaskChanges, TaskId, TaskNotificationMessage, ValidationError,
};

/// User-facing failure kinds.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Rejected input, or a write that could not be carried out.
    #[error("{0}")]
    ValidationFailure(String),

    #[error("Task with ID {0} not found")]
    NotFound(TaskId),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),
}

impl From<ValidationError> for TaskError {
    fn from(e: ValidationError) -> Self {
        TaskError::ValidationFailure(e.to_string())
    }
}

impl From<BrokerError> for TaskError {
    fn from(e: BrokerError) -> Self {
        TaskError::BrokerUnavailable(e.to_string())
    }
}

impl From<CacheError> for TaskError {
    fn from(e: CacheError) -> Self {
        TaskError::CacheUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;

/// Success marker for operations that return no entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Acknowledgement {
    pub message: String,
    /// Rows written by the operation.
    pub affected: usize,
}

impl Acknowledgement {
    fn new(message: impl Into<String>, affected: usize) -> Self {
        Self {
            message: message.into(),
            affected,
        }
    }
}

const CREATE_FAILED: &str = "Failed to create task";
const BULK_CREATE_FAILED: &str = "Failed to create tasks";
const FETCH_ALL_FAILED: &str = "Failed to fetch all tasks";
const FETCH_ONE_FAILED: &str = "Failed to fetch task for given id";
const UPDATE_FAILED: &str = "Failed to update task";
const DELETE_FAILED: &str = "Failed to delete task";
const TASK_NOT_FOUND: &str = "Task not found";

/// Orchestrates repository writes, cache upkeep and notifications.
pub struct TaskService {
    repository: Arc<dyn TaskRepository>,
    cache: CacheGateway,
    publisher: Arc<dyn NotificationPublisher>,
    topology: BrokerTopology,
}

impl TaskService {
    pub fn new(
        repository: Arc<dyn TaskRepository>,
        cache: CacheGateway,
        publisher: Arc<dyn NotificationPublisher>,
        topology: BrokerTopology,
    ) -> Self {
        Self {
            repository,
            cache,
            publisher,
            topology,
        }
    }

    #[tracing::instrument(name = "task.create", skip_all)]
    pub async fn create_task(&self, input: NewTask) -> Result<Task> {
        input.validate()?;

        let mut tx = self.begin(CREATE_FAILED).await?;
        let task = match tx.create(&input).await {
            Ok(task) => task,
            Err(e) => return Err(abort(tx, CREATE_FAILED, e).await),
        };
        tx.commit().await.map_err(|e| storage_failure(CREATE_FAILED, e))?;
        info!(task_id = task.id, "Task created");

        self.invalidate(&[ALL_TASKS_KEY]).await;
        self.notify(TaskNotificationMessage::created(&task)).await;
        Ok(task)
    }

    #[tracing::instrument(name = "task.get_all", skip_all)]
    pub async fn get_all_tasks(&self) -> Result<Vec<Task>> {
        if let Some(tasks) = self.cached::<Vec<Task>>(ALL_TASKS_KEY).await {
            return Ok(tasks);
        }

        let tasks = self
            .repository
            .find_all()
            .await
            .map_err(|e| storage_failure(FETCH_ALL_FAILED, e))?;
        self.populate(ALL_TASKS_KEY, &tasks).await;
        Ok(tasks)
    }

    #[tracing::instrument(name = "task.get", skip(self))]
    pub async fn get_task(&self, id: TaskId) -> Result<Task> {
        let key = task_key(id);
        if let Some(task) = self.cached::<Task>(&key).await {
            return Ok(task);
        }

        let task = self
            .repository
            .find_by_pk(id)
            .await
            .map_err(|e| storage_failure(FETCH_ONE_FAILED, e))?
            .ok_or(TaskError::NotFound(id))?;
        self.populate(&key, &task).await;
        Ok(task)
    }

    #[tracing::instrument(name = "task.update", skip(self, changes))]
    pub async fn update_task(&self, id: TaskId, changes: TaskChanges) -> Result<Task> {
        changes.validate()?;

        let mut tx = self.begin(UPDATE_FAILED).await?;
        let task = match tx.update(id, &changes).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                rollback(tx).await;
                return Err(TaskError::ValidationFailure(TASK_NOT_FOUND.to_string()));
            }
            Err(e) => return Err(abort(tx, UPDATE_FAILED, e).await),
        };
        tx.commit().await.map_err(|e| storage_failure(UPDATE_FAILED, e))?;
        info!(task_id = id, "Task updated");

        self.invalidate(&[task_key(id).as_str(), ALL_TASKS_KEY]).await;
        self.notify(TaskNotificationMessage::updated(&task)).await;
        Ok(task)
    }

    #[tracing::instrument(name = "task.delete", skip(self))]
    pub async fn delete_task(&self, id: TaskId) -> Result<Acknowledgement> {
        let mut tx = self.begin(DELETE_FAILED).await?;
        match tx.destroy(id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                rollback(tx).await;
                return Err(TaskError::NotFound(id));
            }
            Err(e) => return Err(abort(tx, DELETE_FAILED, e).await),
        }
        tx.commit().await.map_err(|e| storage_failure(DELETE_FAILED, e))?;
        info!(task_id = id, "Task deleted");

        self.invalidate(&[task_key(id).as_str(), ALL_TASKS_KEY]).await;
        self.notify(TaskNotificationMessage::deleted(id)).await;
        Ok(Acknowledgement::new("Task deleted successfully", 1))
    }

    /// Insert all tasks in one transaction, or none.
    ///
    /// Every row is validated before the transaction opens. Each inserted
    /// row gets its own CREATE notification after commit.
    #[tracing::instrument(name = "task.bulk_create", skip_all, fields(count = inputs.len()))]
    pub async fn bulk_create_tasks(&self, inputs: Vec<NewTask>) -> Result<Acknowledgement> {
        for (index, input) in inputs.iter().enumerate() {
            input.validate().map_err(|e| {
                TaskError::ValidationFailure(format!("Invalid task at index {}: {}", index, e))
            })?;
        }

        let mut tx = self.begin(BULK_CREATE_FAILED).await?;
        let tasks = match tx.bulk_create(&inputs).await {
            Ok(tasks) => tasks,
            Err(e) => return Err(abort(tx, BULK_CREATE_FAILED, e).await),
        };
        tx.commit()
            .await
            .map_err(|e| storage_failure(BULK_CREATE_FAILED, e))?;
        info!(count = tasks.len(), "Tasks created");

        self.invalidate(&[ALL_TASKS_KEY]).await;
        for task in &tasks {
            self.notify(TaskNotificationMessage::created(task)).await;
        }
        Ok(Acknowledgement::new("Tasks created successfully", tasks.len()))
    }

    async fn begin(&self, context: &'static str) -> Result<Box<dyn TaskTransaction>> {
        self.repository
            .begin()
            .await
            .map_err(|e| storage_failure(context, e))
    }

    /// Cache lookup that treats every cache failure as a miss.
    async fn cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(value)) => {
                debug!(key = %key, "Cache hit");
                Some(value)
            }
            Ok(None) => {
                debug!(key = %key, "Cache miss");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, using repository");
                None
            }
        }
    }

    async fn populate<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        if let Err(e) = self.cache.set(key, value, None).await {
            warn!(key = %key, error = %e, "Failed to populate cache");
        }
    }

    async fn invalidate(&self, keys: &[&str]) {
        for key in keys {
            if let Err(e) = self.cache.del(key).await {
                warn!(key = %key, error = %e, "Failed to invalidate cache entry");
            }
        }
    }

    /// Publish after commit. A failure leaves the committed write in place.
    async fn notify(&self, message: TaskNotificationMessage) {
        let routing_key = self.topology.routing_key(message.operation());
        if let Err(e) = self.publisher.publish(&message, routing_key).await {
            warn!(
                operation = %message.operation(),
                task_id = message.task_id(),
                error = %e,
                "Failed to publish task notification"
            );
        }
    }
}

fn storage_failure(context: &'static str, e: StorageError) -> TaskError {
    error!(error = %e, "{}", context);
    TaskError::ValidationFailure(context.to_string())
}

async fn rollback(tx: Box<dyn TaskTransaction>) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "Rollback failed");
    }
}

async fn abort(tx: Box<dyn TaskTransaction>, context: &'static str, e: StorageError) -> TaskError {
    rollback(tx).await;
    storage_failure(context, e)
}
