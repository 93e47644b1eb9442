//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Tasks table schema.
#[derive(Iden, Clone, Copy)]
pub enum Tasks {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "title"]
    Title,
    #[iden = "description"]
    Description,
    #[iden = "status"]
    Status,
    #[iden = "priority"]
    Priority,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "updated_at"]
    UpdatedAt,
    #[iden = "deleted_at"]
    DeletedAt,
}

/// Every column, in the order rows are decoded.
pub const TASK_COLUMNS: [Tasks; 8] = [
    Tasks::Id,
    Tasks::Title,
    Tasks::Description,
    Tasks::Status,
    Tasks::Priority,
    Tasks::CreatedAt,
    Tasks::UpdatedAt,
    Tasks::DeletedAt,
];

/// SQL for creating the tasks table.
///
/// AUTOINCREMENT keeps ids from being reused after the highest row is
/// deleted.
pub const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL CHECK (length(title) BETWEEN 3 AND 100),
    description TEXT,
    status TEXT NOT NULL DEFAULT 'PENDING'
        CHECK (status IN ('PENDING', 'IN_PROGRESS', 'COMPLETED')),
    priority TEXT NOT NULL DEFAULT 'LOW'
        CHECK (priority IN ('LOW', 'MEDIUM', 'HIGH')),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_deleted_at ON tasks(deleted_at);
"#;
