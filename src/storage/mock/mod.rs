//! Mock task repository for testing.
//!
//! Rows live in a map behind one async mutex. A transaction holds that mutex
//! for its whole lifetime and works on a staged copy, so commit is a swap and
//! rollback (or drop) discards the copy.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{Result, StorageError, TaskRepository, TaskTransaction};
use crate::task::{NewTask, Task, TaskChanges, TaskId};

#[derive(Debug, Clone, Default)]
struct State {
    rows: BTreeMap<TaskId, Task>,
    /// Highest id ever assigned. Ids are never reused.
    last_id: TaskId,
}

impl State {
    fn live(&self, id: TaskId) -> Option<&Task> {
        self.rows.get(&id).filter(|t| t.deleted_at.is_none())
    }
}

#[derive(Default)]
struct Shared {
    fail_on_insert: AtomicBool,
    fail_on_commit: AtomicBool,
    fail_on_read: AtomicBool,
    find_all_count: AtomicUsize,
    find_by_pk_count: AtomicUsize,
    commit_count: AtomicUsize,
    rollback_count: AtomicUsize,
}

/// In-memory task repository.
#[derive(Default)]
pub struct MockTaskRepository {
    state: Arc<Mutex<State>>,
    shared: Arc<Shared>,
}

impl MockTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_on_insert(&self, fail: bool) {
        self.shared.fail_on_insert.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_on_commit(&self, fail: bool) {
        self.shared.fail_on_commit.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_on_read(&self, fail: bool) {
        self.shared.fail_on_read.store(fail, Ordering::SeqCst);
    }

    pub fn find_all_count(&self) -> usize {
        self.shared.find_all_count.load(Ordering::SeqCst)
    }

    pub fn find_by_pk_count(&self) -> usize {
        self.shared.find_by_pk_count.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.shared.commit_count.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.shared.rollback_count.load(Ordering::SeqCst)
    }

    /// Stored row including soft-deleted ones.
    pub async fn row(&self, id: TaskId) -> Option<Task> {
        self.state.lock().await.rows.get(&id).cloned()
    }

    /// Number of stored rows including soft-deleted ones.
    pub async fn row_count(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    fn check_read(&self) -> Result<()> {
        if self.shared.fail_on_read.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("Mock read failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for MockTaskRepository {
    async fn find_all(&self) -> Result<Vec<Task>> {
        self.shared.find_all_count.fetch_add(1, Ordering::SeqCst);
        self.check_read()?;
        let state = self.state.lock().await;
        Ok(state
            .rows
            .values()
            .filter(|t| t.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn find_by_pk(&self, id: TaskId) -> Result<Option<Task>> {
        self.shared.find_by_pk_count.fetch_add(1, Ordering::SeqCst);
        self.check_read()?;
        Ok(self.state.lock().await.live(id).cloned())
    }

    async fn begin(&self) -> Result<Box<dyn TaskTransaction>> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let staged = State::clone(&guard);
        Ok(Box::new(MockTaskTransaction {
            guard,
            staged,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct MockTaskTransaction {
    guard: OwnedMutexGuard<State>,
    staged: State,
    shared: Arc<Shared>,
}

#[async_trait]
impl TaskTransaction for MockTaskTransaction {
    async fn create(&mut self, task: &NewTask) -> Result<Task> {
        if self.shared.fail_on_insert.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("Mock insert failure".to_string()));
        }
        // Mirror the database CHECK constraints.
        task.validate()
            .map_err(|e| StorageError::Constraint(e.to_string()))?;

        let now = Utc::now();
        self.staged.last_id += 1;
        let created = Task {
            id: self.staged.last_id,
            title: task.title.clone(),
            description: task.description.clone(),
            status: task.status_or_default(),
            priority: task.priority_or_default(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.staged.rows.insert(created.id, created.clone());
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
        match self.staged.rows.get_mut(&id) {
            Some(task) if task.deleted_at.is_none() => {
                changes.apply_to(task);
                task.updated_at = Utc::now();
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn destroy(&mut self, id: TaskId) -> Result<Option<Task>> {
        match self.staged.rows.get_mut(&id) {
            Some(task) if task.deleted_at.is_none() => {
                task.deleted_at = Some(Utc::now());
                Ok(Some(task.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if self.shared.fail_on_commit.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("Mock commit failure".to_string()));
        }
        let MockTaskTransaction {
            mut guard,
            staged,
            shared,
        } = *self;
        *guard = staged;
        shared.commit_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.shared.rollback_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
