//! Task operations.
//!
//! Tasks are keyed by their caller-visible `task_id`. Status writes go
//! through [`TaskStatus::advance`], so a stored task never leaves a
//! terminal state regardless of what the caller passes in.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::models::{Task, TaskFilter, TaskKind, TaskStatus};
use super::{Database, WhereClause};
use crate::error::{DatabaseError, ServiceResult};

fn task_where(filter: &TaskFilter) -> WhereClause {
    let mut clause = WhereClause::default();
    clause
        .eq("task_id", filter.task_id.clone())
        .eq("store_id", filter.store_id)
        .eq("index_id", filter.index_id.clone())
        .eq("job_id", filter.job_id.clone())
        .eq("status", filter.status.map(|s| s.as_str().to_string()));
    clause
}

impl Database {
    /// Insert a new task with the given initial status
    pub fn create_task(&self, task_id: &str, kind: TaskKind, status: TaskStatus) -> ServiceResult<Task> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO tasks (task_id, kind, status, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
            params![task_id, kind.as_str(), status.as_str(), now.to_rfc3339()],
        )
        .map_err(DatabaseError::Query)?;

        Ok(Task {
            id: conn.last_insert_rowid(),
            task_id: task_id.to_string(),
            kind,
            store_id: None,
            index_id: None,
            job_id: None,
            status,
            message: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// First task matching every set field of the filter
    pub fn get_task_by_filter(&self, filter: &TaskFilter) -> ServiceResult<Option<Task>> {
        let conn = self.conn.lock().unwrap();
        let clause = task_where(filter);

        let sql = format!(
            "SELECT {} FROM tasks{} ORDER BY id LIMIT 1",
            Task::COLUMNS,
            clause.sql()
        );

        conn.query_row(&sql, clause.params(), Task::from_row)
            .optional()
            .map_err(|e| DatabaseError::Query(e).into())
    }

    /// All tasks matching the filter, oldest first
    pub fn list_tasks(&self, filter: &TaskFilter) -> ServiceResult<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let clause = task_where(filter);

        let sql = format!("SELECT {} FROM tasks{} ORDER BY id", Task::COLUMNS, clause.sql());
        let mut stmt = conn.prepare(&sql).map_err(DatabaseError::Query)?;

        let tasks = stmt
            .query_map(clause.params(), Task::from_row)
            .map_err(DatabaseError::Query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)?;

        Ok(tasks)
    }

    /// Insert or update a task by `task_id` and return the stored row.
    ///
    /// The stored status is the existing status advanced by `task.status`;
    /// every other field is taken from `task` as given.
    pub fn upsert_task(&self, task: &Task) -> ServiceResult<Task> {
        let conn = self.conn.lock().unwrap();

        let existing: Option<String> = conn
            .query_row(
                "SELECT status FROM tasks WHERE task_id = ?1",
                params![task.task_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        let status = match existing {
            Some(current) => TaskStatus::from_str(&current).advance(task.status),
            None => task.status,
        };

        conn.execute(
            r#"
            INSERT INTO tasks (task_id, kind, store_id, index_id, job_id, status, message, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(task_id) DO UPDATE SET
                store_id = excluded.store_id,
                index_id = excluded.index_id,
                job_id = excluded.job_id,
                status = excluded.status,
                message = excluded.message,
                updated_at = excluded.updated_at
            "#,
            params![
                task.task_id,
                task.kind.as_str(),
                task.store_id,
                task.index_id,
                task.job_id,
                status.as_str(),
                task.message,
                task.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(DatabaseError::Query)?;

        let sql = format!("SELECT {} FROM tasks WHERE task_id = ?1", Task::COLUMNS);
        conn.query_row(&sql, params![task.task_id], Task::from_row)
            .map_err(|e| DatabaseError::Query(e).into())
    }

    /// Update an existing task by `task_id`; never inserts.
    ///
    /// Returns `None` when the row is gone (e.g. its store was deleted while
    /// the caller held a stale copy). Status advances as in [`Self::upsert_task`].
    pub fn update_task(&self, task: &Task) -> ServiceResult<Option<Task>> {
        let conn = self.conn.lock().unwrap();

        let existing: Option<String> = conn
            .query_row(
                "SELECT status FROM tasks WHERE task_id = ?1",
                params![task.task_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        let Some(current) = existing else {
            return Ok(None);
        };
        let status = TaskStatus::from_str(&current).advance(task.status);

        conn.execute(
            "UPDATE tasks SET store_id = ?2, index_id = ?3, job_id = ?4, status = ?5, \
             message = ?6, updated_at = ?7 WHERE task_id = ?1",
            params![
                task.task_id,
                task.store_id,
                task.index_id,
                task.job_id,
                status.as_str(),
                task.message,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(DatabaseError::Query)?;

        let sql = format!("SELECT {} FROM tasks WHERE task_id = ?1", Task::COLUMNS);
        conn.query_row(&sql, params![task.task_id], Task::from_row)
            .optional()
            .map_err(|e| DatabaseError::Query(e).into())
    }

    /// Delete every task that belongs to a store
    pub fn delete_tasks_for_store(&self, store_id: i64) -> ServiceResult<usize> {
        let conn = self.conn.lock().unwrap();

        let count = conn
            .execute("DELETE FROM tasks WHERE store_id = ?1", params![store_id])
            .map_err(DatabaseError::Query)?;

        Ok(count)
    }

    /// Fail tasks a previous process left mid-workflow.
    ///
    /// Tasks with a `job_id` are left alone; the reconciler can still
    /// resolve them from the remote job. Unfinished file tasks of the failed
    /// tasks are failed with them.
    pub fn fail_interrupted_tasks(&self, message: &str) -> ServiceResult<usize> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();

        // must run while the parent tasks still match
        conn.execute(
            "UPDATE file_tasks SET status = ?1, message = ?2, updated_at = ?3 \
             WHERE status IN ('PENDING', 'RUNNING') AND task_id IN \
             (SELECT task_id FROM tasks WHERE status IN ('PENDING', 'RUNNING') AND job_id IS NULL)",
            params![TaskStatus::Failed.as_str(), message, now],
        )
        .map_err(DatabaseError::Query)?;

        let count = conn
            .execute(
                "UPDATE tasks SET status = ?1, message = ?2, updated_at = ?3 \
                 WHERE status IN ('PENDING', 'RUNNING') AND job_id IS NULL",
                params![TaskStatus::Failed.as_str(), message, now],
            )
            .map_err(DatabaseError::Query)?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::FileTask;

    #[test]
    fn test_create_and_get_task() {
        let db = Database::open_in_memory().unwrap();
        db.create_task("t-1", TaskKind::CreateStore, TaskStatus::Running)
            .unwrap();

        let task = db
            .get_task_by_filter(&TaskFilter::by_task_id("t-1"))
            .unwrap()
            .unwrap();
        assert_eq!(task.kind, TaskKind::CreateStore);
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.job_id.is_none());

        assert!(
            db.get_task_by_filter(&TaskFilter::by_task_id("missing"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_upsert_updates_fields() {
        let db = Database::open_in_memory().unwrap();
        let mut task = db
            .create_task("t-1", TaskKind::AddFiles, TaskStatus::Running)
            .unwrap();

        task.index_id = Some("idx-1".to_string());
        task.job_id = Some("job-1".to_string());
        let stored = db.upsert_task(&task).unwrap();

        assert_eq!(stored.index_id.as_deref(), Some("idx-1"));
        assert_eq!(stored.job_id.as_deref(), Some("job-1"));

        let by_job = db
            .get_task_by_filter(&TaskFilter {
                job_id: Some("job-1".to_string()),
                ..Default::default()
            })
            .unwrap()
            .unwrap();
        assert_eq!(by_job.task_id, "t-1");
    }

    #[test]
    fn test_upsert_never_leaves_terminal_status() {
        let db = Database::open_in_memory().unwrap();
        let mut task = db
            .create_task("t-1", TaskKind::AddFiles, TaskStatus::Running)
            .unwrap();

        task.status = TaskStatus::Failed;
        task.message = Some("boom".to_string());
        db.upsert_task(&task).unwrap();

        task.status = TaskStatus::Running;
        task.message = Some("still indexing".to_string());
        let stored = db.upsert_task(&task).unwrap();

        assert_eq!(stored.status, TaskStatus::Failed);
        // message is still refreshed
        assert_eq!(stored.message.as_deref(), Some("still indexing"));
    }

    #[test]
    fn test_fail_interrupted_tasks_skips_submitted_jobs() {
        let db = Database::open_in_memory().unwrap();
        db.create_task("orphan", TaskKind::CreateStore, TaskStatus::Running)
            .unwrap();
        let mut submitted = db
            .create_task("submitted", TaskKind::AddFiles, TaskStatus::Running)
            .unwrap();
        submitted.job_id = Some("job".to_string());
        db.upsert_task(&submitted).unwrap();
        db.create_task("done", TaskKind::AddFiles, TaskStatus::Completed)
            .unwrap();

        let mut pending_file = FileTask::new("orphan", "a.txt");
        pending_file.status = TaskStatus::Running;
        db.upsert_file_task(&pending_file).unwrap();
        let mut uploaded = FileTask::new("submitted", "b.txt");
        uploaded.status = TaskStatus::Running;
        db.upsert_file_task(&uploaded).unwrap();

        let count = db.fail_interrupted_tasks("interrupted").unwrap();
        assert_eq!(count, 1);

        let orphan_files = db.list_file_tasks_by_task("orphan").unwrap();
        assert_eq!(orphan_files[0].status, TaskStatus::Failed);
        assert_eq!(orphan_files[0].message.as_deref(), Some("interrupted"));
        let submitted_files = db.list_file_tasks_by_task("submitted").unwrap();
        assert_eq!(submitted_files[0].status, TaskStatus::Running);

        let failed = db
            .list_tasks(&TaskFilter {
                status: Some(TaskStatus::Failed),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].task_id, "orphan");
        assert_eq!(failed[0].message.as_deref(), Some("interrupted"));
    }

    #[test]
    fn test_update_does_not_resurrect_deleted_task() {
        let db = Database::open_in_memory().unwrap();
        let mut task = db
            .create_task("t-1", TaskKind::CreateStore, TaskStatus::Running)
            .unwrap();
        task.store_id = Some(7);
        task.job_id = Some("job-1".to_string());
        db.upsert_task(&task).unwrap();

        task.status = TaskStatus::Completed;
        let stored = db.update_task(&task).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);

        db.delete_tasks_for_store(7).unwrap();
        assert!(db.update_task(&task).unwrap().is_none());
        assert!(
            db.get_task_by_filter(&TaskFilter::by_task_id("t-1"))
                .unwrap()
                .is_none()
        );
    }
}
