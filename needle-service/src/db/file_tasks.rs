//! File task operations.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::models::{FileTask, FileTaskFilter, TaskStatus};
use super::{Database, WhereClause};
use crate::error::{DatabaseError, ServiceResult};

fn file_task_where(filter: &FileTaskFilter) -> WhereClause {
    let mut clause = WhereClause::default();
    clause
        .eq("task_id", filter.task_id.clone())
        .eq("doc_id", filter.doc_id.clone())
        .eq("file_id", filter.file_id)
        .eq("status", filter.status.map(|s| s.as_str().to_string()));
    clause
}

impl Database {
    /// Insert the file task if it has no id yet, otherwise update it.
    /// Returns the stored row.
    pub fn upsert_file_task(&self, file_task: &FileTask) -> ServiceResult<FileTask> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        let id = match file_task.id {
            Some(id) => {
                conn.execute(
                    "UPDATE file_tasks SET file_id = ?1, doc_name = ?2, doc_id = ?3, status = ?4, message = ?5, updated_at = ?6 WHERE id = ?7",
                    params![
                        file_task.file_id,
                        file_task.doc_name,
                        file_task.doc_id,
                        file_task.status.as_str(),
                        file_task.message,
                        now.to_rfc3339(),
                        id,
                    ],
                )
                .map_err(DatabaseError::Query)?;
                id
            }
            None => {
                conn.execute(
                    r#"
                    INSERT INTO file_tasks (task_id, file_id, doc_name, doc_id, status, message, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    "#,
                    params![
                        file_task.task_id,
                        file_task.file_id,
                        file_task.doc_name,
                        file_task.doc_id,
                        file_task.status.as_str(),
                        file_task.message,
                        file_task.created_at.to_rfc3339(),
                        now.to_rfc3339(),
                    ],
                )
                .map_err(DatabaseError::Query)?;
                conn.last_insert_rowid()
            }
        };

        let sql = format!("SELECT {} FROM file_tasks WHERE id = ?1", FileTask::COLUMNS);
        conn.query_row(&sql, params![id], FileTask::from_row)
            .map_err(|e| DatabaseError::Query(e).into())
    }

    /// Find the file task for `(task_id, doc_id)`, creating it if absent,
    /// and overwrite its status and message.
    ///
    /// Applying the same observation twice leaves the row unchanged apart
    /// from `updated_at`.
    pub fn merge_file_task_status(
        &self,
        task_id: &str,
        doc_id: &str,
        doc_name: &str,
        status: TaskStatus,
        message: Option<&str>,
    ) -> ServiceResult<FileTask> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM file_tasks WHERE task_id = ?1 AND doc_id = ?2 ORDER BY id LIMIT 1",
                params![task_id, doc_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(DatabaseError::Query)?;

        let id = match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE file_tasks SET status = ?1, message = ?2, updated_at = ?3 WHERE id = ?4",
                    params![status.as_str(), message, now, id],
                )
                .map_err(DatabaseError::Query)?;
                id
            }
            None => {
                conn.execute(
                    r#"
                    INSERT INTO file_tasks (task_id, doc_name, doc_id, status, message, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                    "#,
                    params![task_id, doc_name, doc_id, status.as_str(), message, now],
                )
                .map_err(DatabaseError::Query)?;
                conn.last_insert_rowid()
            }
        };

        let sql = format!("SELECT {} FROM file_tasks WHERE id = ?1", FileTask::COLUMNS);
        conn.query_row(&sql, params![id], FileTask::from_row)
            .map_err(|e| DatabaseError::Query(e).into())
    }

    /// Every file task under a task, in creation order
    pub fn list_file_tasks_by_task(&self, task_id: &str) -> ServiceResult<Vec<FileTask>> {
        self.list_file_tasks(&FileTaskFilter {
            task_id: Some(task_id.to_string()),
            ..Default::default()
        })
    }

    pub fn list_file_tasks(&self, filter: &FileTaskFilter) -> ServiceResult<Vec<FileTask>> {
        let conn = self.conn.lock().unwrap();
        let clause = file_task_where(filter);

        let sql = format!(
            "SELECT {} FROM file_tasks{} ORDER BY id",
            FileTask::COLUMNS,
            clause.sql()
        );
        let mut stmt = conn.prepare(&sql).map_err(DatabaseError::Query)?;

        let file_tasks = stmt
            .query_map(clause.params(), FileTask::from_row)
            .map_err(DatabaseError::Query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)?;

        Ok(file_tasks)
    }

    /// Delete the file tasks of every task that belongs to a store.
    /// Must run before the tasks themselves are deleted.
    pub fn delete_file_tasks_for_store(&self, store_id: i64) -> ServiceResult<usize> {
        let conn = self.conn.lock().unwrap();

        let count = conn
            .execute(
                "DELETE FROM file_tasks WHERE task_id IN (SELECT task_id FROM tasks WHERE store_id = ?1)",
                params![store_id],
            )
            .map_err(DatabaseError::Query)?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TaskKind;

    #[test]
    fn test_upsert_inserts_then_updates() {
        let db = Database::open_in_memory().unwrap();

        let mut file_task = FileTask::new("t-1", "a.txt");
        file_task.status = TaskStatus::Running;
        let stored = db.upsert_file_task(&file_task).unwrap();
        assert!(stored.id.is_some());

        let mut updated = stored.clone();
        updated.status = TaskStatus::Failed;
        updated.message = Some("lease denied".to_string());
        db.upsert_file_task(&updated).unwrap();

        let rows = db.list_file_tasks_by_task("t-1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, TaskStatus::Failed);
        assert_eq!(rows[0].message.as_deref(), Some("lease denied"));
    }

    #[test]
    fn test_merge_status_is_idempotent() {
        let db = Database::open_in_memory().unwrap();

        let mut file_task = FileTask::new("t-1", "a.txt");
        file_task.doc_id = Some("doc-1".to_string());
        file_task.status = TaskStatus::Running;
        db.upsert_file_task(&file_task).unwrap();

        db.merge_file_task_status("t-1", "doc-1", "a.txt", TaskStatus::Completed, None)
            .unwrap();
        db.merge_file_task_status("t-1", "doc-1", "a.txt", TaskStatus::Completed, None)
            .unwrap();
        // unknown doc ids are created
        db.merge_file_task_status("t-1", "doc-2", "b.txt", TaskStatus::Running, None)
            .unwrap();

        let rows = db.list_file_tasks_by_task("t-1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].doc_id.as_deref(), Some("doc-1"));
        assert_eq!(rows[0].status, TaskStatus::Completed);
        assert_eq!(rows[1].doc_name, "b.txt");
    }

    #[test]
    fn test_delete_file_tasks_for_store() {
        let db = Database::open_in_memory().unwrap();
        let mut task = db
            .create_task("t-1", TaskKind::CreateStore, TaskStatus::Running)
            .unwrap();
        task.store_id = Some(42);
        db.upsert_task(&task).unwrap();
        db.create_task("t-2", TaskKind::AddFiles, TaskStatus::Running)
            .unwrap();

        db.upsert_file_task(&FileTask::new("t-1", "a.txt")).unwrap();
        db.upsert_file_task(&FileTask::new("t-2", "b.txt")).unwrap();

        assert_eq!(db.delete_file_tasks_for_store(42).unwrap(), 1);
        assert!(db.list_file_tasks_by_task("t-1").unwrap().is_empty());
        assert_eq!(db.list_file_tasks_by_task("t-2").unwrap().len(), 1);
    }
}
