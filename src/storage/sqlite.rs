//! SQLite TaskRepository implementation.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sea_query::{Expr, Order, Query, SimpleExpr, SqliteQueryBuilder};
use sqlx::error::ErrorKind;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::storage::schema::{Tasks, CREATE_TASKS_TABLE, TASK_COLUMNS};
use crate::storage::{Result, StorageError, TaskRepository, TaskTransaction};
use crate::task::{NewTask, Task, TaskChanges, TaskId, TaskPriority, TaskStatus};

/// Path that selects a private in-memory database.
pub const MEMORY_PATH: &str = ":memory:";

/// How long a writer waits for a competing write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite implementation of TaskRepository.
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    /// Create a new SQLite task repository over an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a pool sized from `config`, creating the database file and its
    /// parent directory when missing.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        if config.path == MEMORY_PATH {
            return Self::in_memory().await;
        }

        if let Some(parent) = std::path::Path::new(&config.path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool.max)
            .min_connections(config.pool.min)
            .acquire_timeout(config.pool.acquire_timeout())
            .idle_timeout(Some(config.pool.idle_timeout()))
            .connect_with(options)
            .await?;

        info!(
            path = %config.path,
            max_connections = config.pool.max,
            "Connected to SQLite"
        );
        Ok(Self::new(pool))
    }

    /// Single-connection in-memory database.
    ///
    /// Every connection to `:memory:` is a separate database, so the pool
    /// holds exactly one connection and never retires it.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create the tasks table if it does not exist.
    pub async fn init(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_TASKS_TABLE).execute(&self.pool).await?;
        debug!("Tasks schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidTimestamp {
            reason: e.to_string(),
            value,
        })
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let status: String = row.try_get("status")?;
    let priority: String = row.try_get("priority")?;
    let deleted_at: Option<String> = row.try_get("deleted_at")?;

    Ok(Task {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        status: TaskStatus::from_str(&status)
            .map_err(|e| StorageError::InvalidValue(e.to_string()))?,
        priority: TaskPriority::from_str(&priority)
            .map_err(|e| StorageError::InvalidValue(e.to_string()))?,
        created_at: parse_timestamp(row.try_get("created_at")?)?,
        updated_at: parse_timestamp(row.try_get("updated_at")?)?,
        deleted_at: deleted_at.map(parse_timestamp).transpose()?,
    })
}

/// Surface CHECK / NOT NULL / UNIQUE failures as constraint violations.
fn map_write_error(e: sqlx::Error) -> StorageError {
    let kind = e.as_database_error().map(|db| db.kind());
    match kind {
        Some(ErrorKind::CheckViolation)
        | Some(ErrorKind::NotNullViolation)
        | Some(ErrorKind::UniqueViolation) => StorageError::Constraint(e.to_string()),
        _ => StorageError::Database(e),
    }
}

fn select_live() -> sea_query::SelectStatement {
    Query::select()
        .columns(TASK_COLUMNS)
        .from(Tasks::Table)
        .and_where(Expr::col(Tasks::DeletedAt).is_null())
        .to_owned()
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn find_all(&self) -> Result<Vec<Task>> {
        let query = select_live()
            .order_by(Tasks::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn find_by_pk(&self, id: TaskId) -> Result<Option<Task>> {
        let query = select_live()
            .and_where(Expr::col(Tasks::Id).eq(id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn begin(&self) -> Result<Box<dyn TaskTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTaskTransaction { tx }))
    }
}

/// Open SQLite transaction. sqlx rolls it back if dropped uncommitted.
pub struct SqliteTaskTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl TaskTransaction for SqliteTaskTransaction {
    async fn create(&mut self, task: &NewTask) -> Result<Task> {
        let now = format_timestamp(Utc::now());

        let query = Query::insert()
            .into_table(Tasks::Table)
            .columns([
                Tasks::Title,
                Tasks::Description,
                Tasks::Status,
                Tasks::Priority,
                Tasks::CreatedAt,
                Tasks::UpdatedAt,
            ])
            .values_panic([
                task.title.clone().into(),
                task.description.clone().into(),
                task.status_or_default().as_str().into(),
                task.priority_or_default().as_str().into(),
                now.clone().into(),
                now.into(),
            ])
            .returning(Query::returning().columns(TASK_COLUMNS))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(map_write_error)?;
        let created = task_from_row(&row)?;

        debug!(task_id = created.id, "Inserted task");
        Ok(created)
    }

    async fn bulk_create(&mut self, tasks: &[NewTask]) -> Result<Vec<Task>> {
        let mut created = Vec::with_capacity(tasks.len());
        for task in tasks {
            created.push(self.create(task).await?);
        }
        Ok(created)
    }

    async fn update(&mut self, id: TaskId, changes: &TaskChanges) -> Result<Option<Task>> {
        let mut values: Vec<(Tasks, SimpleExpr)> = Vec::new();
        if let Some(title) = &changes.title {
            values.push((Tasks::Title, title.clone().into()));
        }
        if let Some(description) = &changes.description {
            values.push((Tasks::Description, description.clone().into()));
        }
        if let Some(status) = changes.status {
            values.push((Tasks::Status, status.as_str().into()));
        }
        if let Some(priority) = changes.priority {
            values.push((Tasks::Priority, priority.as_str().into()));
        }
        values.push((Tasks::UpdatedAt, format_timestamp(Utc::now()).into()));

        // Single statement: the row is matched, changed and read back while
        // holding the write lock.
        let query = Query::update()
            .table(Tasks::Table)
            .values(values)
            .and_where(Expr::col(Tasks::Id).eq(id))
            .and_where(Expr::col(Tasks::DeletedAt).is_null())
            .returning(Query::returning().columns(TASK_COLUMNS))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_write_error)?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn destroy(&mut self, id: TaskId) -> Result<Option<Task>> {
        let query = Query::update()
            .table(Tasks::Table)
            .values([(Tasks::DeletedAt, format_timestamp(Utc::now()).into())])
            .and_where(Expr::col(Tasks::Id).eq(id))
            .and_where(Expr::col(Tasks::DeletedAt).is_null())
            .returning(Query::returning().columns(TASK_COLUMNS))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *self.tx).await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn repo() -> SqliteTaskRepository {
        let repo = SqliteTaskRepository::in_memory().await.unwrap();
        repo.init().await.unwrap();
        repo
    }

    async fn create(repo: &SqliteTaskRepository, task: NewTask) -> Task {
        let mut tx = repo.begin().await.unwrap();
        let created = tx.create(&task).await.unwrap();
        tx.commit().await.unwrap();
        created
    }

    #[tokio::test]
    async fn test_create_applies_defaults() {
        let repo = repo().await;

        let task = create(&repo, NewTask::new("Write docs")).await;

        assert!(task.id > 0);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, TaskPriority::Low);
        assert_eq!(task.created_at, task.updated_at);
        assert_eq!(repo.find_by_pk(task.id).await.unwrap(), Some(task));
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let repo = repo().await;
        create(&repo, NewTask::new("Survives")).await;

        repo.init().await.unwrap();

        assert_eq!(repo.find_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_uncommitted_insert_is_invisible_after_rollback() {
        let repo = repo().await;

        let mut tx = repo.begin().await.unwrap();
        tx.create(&NewTask::new("Never seen")).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(repo.find_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_check_constraint_maps_to_constraint_error() {
        let repo = repo().await;

        let mut tx = repo.begin().await.unwrap();
        let result = tx.create(&NewTask::new("ab")).await;

        assert!(matches!(result, Err(StorageError::Constraint(_))));
    }

    #[tokio::test]
    async fn test_update_changes_only_given_fields() {
        let repo = repo().await;
        let task = create(&repo, NewTask::new("Write docs").with_description("first")).await;

        let mut tx = repo.begin().await.unwrap();
        let updated = tx
            .update(
                task.id,
                &TaskChanges {
                    status: Some(TaskStatus::Completed),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(updated.status, TaskStatus::Completed);
        assert_eq!(updated.title, "Write docs");
        assert_eq!(updated.description.as_deref(), Some("first"));
        assert!(updated.updated_at >= task.updated_at);
        assert_eq!(updated.created_at, task.created_at);
    }

    #[tokio::test]
    async fn test_update_missing_row_is_none() {
        let repo = repo().await;

        let mut tx = repo.begin().await.unwrap();
        let result = tx.update(99, &TaskChanges::default()).await.unwrap();

        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_destroy_soft_deletes() {
        let repo = repo().await;
        let task = create(&repo, NewTask::new("Delete me")).await;

        let mut tx = repo.begin().await.unwrap();
        let deleted = tx.destroy(task.id).await.unwrap().unwrap();
        tx.commit().await.unwrap();

        assert!(deleted.deleted_at.is_some());
        assert_eq!(repo.find_by_pk(task.id).await.unwrap(), None);
        assert!(repo.find_all().await.unwrap().is_empty());

        let mut tx = repo.begin().await.unwrap();
        assert!(tx.destroy(task.id).await.unwrap().is_none());
        assert!(tx
            .update(task.id, &TaskChanges::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_ids_are_not_reused_after_delete() {
        let repo = repo().await;
        let first = create(&repo, NewTask::new("First")).await;

        let mut tx = repo.begin().await.unwrap();
        tx.destroy(first.id).await.unwrap();
        tx.commit().await.unwrap();

        let second = create(&repo, NewTask::new("Second")).await;
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn test_bulk_create_failure_rolls_back_all_rows() {
        let repo = repo().await;

        let mut tx = repo.begin().await.unwrap();
        let result = tx
            .bulk_create(&[NewTask::new("Valid one"), NewTask::new("no")])
            .await;
        assert!(result.is_err());
        tx.rollback().await.unwrap();

        assert!(repo.find_all().await.unwrap().is_empty());
    }

    #[test]
    fn test_timestamp_round_trip() {
        let now = Utc::now();
        let parsed = parse_timestamp(format_timestamp(now)).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn test_invalid_timestamp() {
        assert!(matches!(
            parse_timestamp("yesterday".to_string()),
            Err(StorageError::InvalidTimestamp { .. })
        ));
    }
}
