//! Database model structs.
//!
//! This module contains the data structures for database records and the
//! typed filters used to query them.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use super::parse_timestamp;

/// Lifecycle status shared by tasks and file tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "PENDING" => TaskStatus::Pending,
            "COMPLETED" => TaskStatus::Completed,
            "FAILED" => TaskStatus::Failed,
            _ => TaskStatus::Running,
        }
    }

    /// Map a status string reported by the indexing service.
    ///
    /// Anything the service has not finished with (`RUNNING`, `PARSING`,
    /// `INSERT`, ...) counts as running.
    pub fn from_remote(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "FINISH" | "COMPLETED" | "SUCCESS" => TaskStatus::Completed,
            "FAILED" | "FAIL" | "INSERT_ERROR" => TaskStatus::Failed,
            "PENDING" => TaskStatus::Pending,
            _ => TaskStatus::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Running => 1,
            TaskStatus::Completed | TaskStatus::Failed => 2,
        }
    }

    /// The status after observing `next`; never moves backwards or out of a
    /// terminal state.
    pub fn advance(self, next: TaskStatus) -> TaskStatus {
        if self.is_terminal() || next.rank() < self.rank() {
            self
        } else {
            next
        }
    }
}

/// Which workflow a task runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    CreateStore,
    AddFiles,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::CreateStore => "create_store",
            TaskKind::AddFiles => "add_files",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "create_store" => TaskKind::CreateStore,
            _ => TaskKind::AddFiles,
        }
    }
}

/// One top-level ingestion workflow invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub task_id: String,
    pub kind: TaskKind,
    /// Internal store row id, once the store exists
    pub store_id: Option<i64>,
    pub index_id: Option<String>,
    pub job_id: Option<String>,
    pub status: TaskStatus,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub(crate) const COLUMNS: &'static str = "id, task_id, kind, store_id, index_id, job_id, status, message, created_at, updated_at";

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let kind_str: String = row.get(2)?;
        let status_str: String = row.get(6)?;
        let created_at_str: String = row.get(8)?;
        let updated_at_str: String = row.get(9)?;

        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            kind: TaskKind::from_str(&kind_str),
            store_id: row.get(3)?,
            index_id: row.get(4)?,
            job_id: row.get(5)?,
            status: TaskStatus::from_str(&status_str),
            message: row.get(7)?,
            created_at: parse_timestamp(&created_at_str),
            updated_at: parse_timestamp(&updated_at_str),
        })
    }
}

/// Per-file status under a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTask {
    /// `None` until the row is first written
    pub id: Option<i64>,
    pub task_id: String,
    /// Local file row this sub-task was created for, if any
    pub file_id: Option<i64>,
    pub doc_name: String,
    pub doc_id: Option<String>,
    pub status: TaskStatus,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileTask {
    pub(crate) const COLUMNS: &'static str =
        "id, task_id, file_id, doc_name, doc_id, status, message, created_at, updated_at";

    pub fn new(task_id: &str, doc_name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            task_id: task_id.to_string(),
            file_id: None,
            doc_name: doc_name.to_string(),
            doc_id: None,
            status: TaskStatus::Pending,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let status_str: String = row.get(5)?;
        let created_at_str: String = row.get(7)?;
        let updated_at_str: String = row.get(8)?;

        Ok(Self {
            id: Some(row.get(0)?),
            task_id: row.get(1)?,
            file_id: row.get(2)?,
            doc_name: row.get(3)?,
            doc_id: row.get(4)?,
            status: TaskStatus::from_str(&status_str),
            message: row.get(6)?,
            created_at: parse_timestamp(&created_at_str),
            updated_at: parse_timestamp(&updated_at_str),
        })
    }
}

/// A knowledge store backed by a remote category and index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    pub id: i64,
    pub name: String,
    pub category_id: Option<String>,
    pub index_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Store {
    pub(crate) const COLUMNS: &'static str =
        "id, name, category_id, index_id, created_at, updated_at";

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let created_at_str: String = row.get(4)?;
        let updated_at_str: String = row.get(5)?;

        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            category_id: row.get(2)?,
            index_id: row.get(3)?,
            created_at: parse_timestamp(&created_at_str),
            updated_at: parse_timestamp(&updated_at_str),
        })
    }
}

/// A file uploaded into a store. Rows whose upload failed keep `doc_id`
/// unset and stay as a record of the attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreFile {
    pub id: i64,
    pub store_id: i64,
    pub doc_name: String,
    pub doc_id: Option<String>,
    pub local_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoreFile {
    pub(crate) const COLUMNS: &'static str =
        "id, store_id, doc_name, doc_id, local_path, created_at, updated_at";

    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let created_at_str: String = row.get(5)?;
        let updated_at_str: String = row.get(6)?;

        Ok(Self {
            id: row.get(0)?,
            store_id: row.get(1)?,
            doc_name: row.get(2)?,
            doc_id: row.get(3)?,
            local_path: row.get(4)?,
            created_at: parse_timestamp(&created_at_str),
            updated_at: parse_timestamp(&updated_at_str),
        })
    }
}

// ==================== Typed filters ====================
//
// Each set field becomes an equality predicate; unset fields are ignored.

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub task_id: Option<String>,
    pub store_id: Option<i64>,
    pub index_id: Option<String>,
    pub job_id: Option<String>,
    pub status: Option<TaskStatus>,
}

impl TaskFilter {
    pub fn by_task_id(task_id: &str) -> Self {
        Self {
            task_id: Some(task_id.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileTaskFilter {
    pub task_id: Option<String>,
    pub doc_id: Option<String>,
    pub file_id: Option<i64>,
    pub status: Option<TaskStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreFilter {
    pub id: Option<i64>,
    pub index_id: Option<String>,
    pub category_id: Option<String>,
}

impl StoreFilter {
    pub fn by_index_id(index_id: &str) -> Self {
        Self {
            index_id: Some(index_id.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    pub store_id: Option<i64>,
    pub doc_id: Option<String>,
    /// `Some(true)` only rows with a staged copy, `Some(false)` only rows without
    pub staged: Option<bool>,
}
