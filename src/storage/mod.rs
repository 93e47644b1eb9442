//! Task persistence.
//!
//! This module contains:
//! - `TaskRepository` / `TaskTransaction` traits: transactional task writes
//!   and soft-delete aware reads
//! - Implementations: SQLite (sqlx + sea-query), Mock (in-memory)

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(not(feature = "sqlite"))]
use tracing::error;
use tracing::info;

use crate::config::{DatabaseConfig, DatabaseType};
use crate::task::{NewTask, Task, TaskChanges, TaskId};

pub mod mock;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use mock::MockTaskRepository;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteTaskRepository;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },

    #[error("Invalid column value: {0}")]
    InvalidValue(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Read access to tasks and the entry point for writes.
///
/// Reads never return soft-deleted rows.
///
/// Implementations:
/// - `SqliteTaskRepository`: SQLite via sqlx
/// - `MockTaskRepository`: in-memory, for tests and the `memory` backend
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// All live tasks, ordered by id.
    async fn find_all(&self) -> Result<Vec<Task>>;

    async fn find_by_pk(&self, id: TaskId) -> Result<Option<Task>>;

    /// Open a transaction. Writes are only visible to readers after `commit`.
    async fn begin(&self) -> Result<Box<dyn TaskTransaction>>;
}

/// Writes inside one transaction.
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait TaskTransaction: Send {
    /// Insert one task. `id`, `created_at` and `updated_at` are assigned here.
    async fn create(&mut self, task: &NewTask) -> Result<Task>;

    /// Insert several tasks; all or none become visible on commit.
    async fn bulk_create(&mut self, tasks: &[NewTask]) -> Result<Vec<Task>>;

    /// Apply `changes` to a live task and return the stored result.
    ///
    /// `None` when no live task has this id.
    async fn update(&mut self, id: TaskId, changes: &TaskChanges) -> Result<Option<Task>>;

    /// Soft delete a live task and return the deleted row.
    ///
    /// `None` when no live task has this id.
    async fn destroy(&mut self, id: TaskId) -> Result<Option<Task>>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Initialize the task repository for the configured backend.
pub async fn init_storage(config: &DatabaseConfig) -> Result<Arc<dyn TaskRepository>> {
    match config.database_type {
        #[cfg(feature = "sqlite")]
        DatabaseType::Sqlite => {
            info!(path = %config.path, "Storage: sqlite");
            let repo = SqliteTaskRepository::connect(config).await?;
            repo.init().await?;
            Ok(Arc::new(repo))
        }
        #[cfg(not(feature = "sqlite"))]
        DatabaseType::Sqlite => {
            error!("SQLite storage requested but 'sqlite' feature is not enabled");
            Err(StorageError::NotImplemented(
                "SQLite support requires the 'sqlite' feature".to_string(),
            ))
        }
        DatabaseType::Memory => {
            info!("Storage: in-memory");
            Ok(Arc::new(MockTaskRepository::new()))
        }
    }
}
