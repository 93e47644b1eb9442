//! Notification message emitted after a committed task mutation.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::{Task, TaskId};

/// Kind of mutation a notification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub const ALL: [OperationType; 3] = [Self::Create, Self::Update, Self::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire message published on the notifications exchange.
///
/// The timestamp is taken when the message is built, which the orchestrator
/// does immediately before publishing. Fields are read-only once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskNotificationMessage {
    #[serde(rename = "type")]
    operation: OperationType,
    task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Task>,
    timestamp: String,
}

impl TaskNotificationMessage {
    pub fn created(task: &Task) -> Self {
        Self::build(OperationType::Create, task.id, Some(task.clone()))
    }

    pub fn updated(task: &Task) -> Self {
        Self::build(OperationType::Update, task.id, Some(task.clone()))
    }

    /// Deletions carry no payload.
    pub fn deleted(task_id: TaskId) -> Self {
        Self::build(OperationType::Delete, task_id, None)
    }

    fn build(operation: OperationType, task_id: TaskId, payload: Option<Task>) -> Self {
        Self {
            operation,
            task_id,
            payload,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn operation(&self) -> OperationType {
        self.operation
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn payload(&self) -> Option<&Task> {
        self.payload.as_ref()
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }
}
