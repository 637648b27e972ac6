//! Store file operations.

use chrono::Utc;
use rusqlite::params;

use super::models::{FileFilter, StoreFile};
use super::{Database, WhereClause};
use crate::error::{DatabaseError, ServiceResult};

impl Database {
    /// Record that a file is about to be processed for a store
    pub fn insert_file(&self, store_id: i64, doc_name: &str) -> ServiceResult<StoreFile> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO files (store_id, doc_name, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
            params![store_id, doc_name, now.to_rfc3339()],
        )
        .map_err(DatabaseError::Query)?;

        Ok(StoreFile {
            id: conn.last_insert_rowid(),
            store_id,
            doc_name: doc_name.to_string(),
            doc_id: None,
            local_path: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Persist `local_path` and `doc_id` as they become known
    pub fn update_file(&self, file: &StoreFile) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "UPDATE files SET doc_id = ?1, local_path = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                file.doc_id,
                file.local_path,
                Utc::now().to_rfc3339(),
                file.id
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    pub fn list_files(&self, filter: &FileFilter) -> ServiceResult<Vec<StoreFile>> {
        let conn = self.conn.lock().unwrap();

        let mut clause = WhereClause::default();
        clause
            .eq("store_id", filter.store_id)
            .eq("doc_id", filter.doc_id.clone())
            .is_null("local_path", filter.staged.map(|staged| !staged));

        let sql = format!(
            "SELECT {} FROM files{} ORDER BY id",
            StoreFile::COLUMNS,
            clause.sql()
        );
        let mut stmt = conn.prepare(&sql).map_err(DatabaseError::Query)?;

        let files = stmt
            .query_map(clause.params(), StoreFile::from_row)
            .map_err(DatabaseError::Query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)?;

        Ok(files)
    }

    pub fn delete_file(&self, id: i64) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute("DELETE FROM files WHERE id = ?1", params![id])
            .map_err(DatabaseError::Query)?;

        Ok(())
    }

    pub fn delete_files_for_store(&self, store_id: i64) -> ServiceResult<usize> {
        let conn = self.conn.lock().unwrap();

        let count = conn
            .execute("DELETE FROM files WHERE store_id = ?1", params![store_id])
            .map_err(DatabaseError::Query)?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_filters() {
        let db = Database::open_in_memory().unwrap();

        let mut staged = db.insert_file(1, "a.txt").unwrap();
        staged.local_path = Some("/tmp/a.txt".to_string());
        staged.doc_id = Some("doc-a".to_string());
        db.update_file(&staged).unwrap();

        // upload failed: stays without doc_id
        db.insert_file(1, "b.txt").unwrap();
        db.insert_file(2, "c.txt").unwrap();

        assert_eq!(
            db.list_files(&FileFilter {
                store_id: Some(1),
                ..Default::default()
            })
            .unwrap()
            .len(),
            2
        );

        let by_doc = db
            .list_files(&FileFilter {
                doc_id: Some("doc-a".to_string()),
                staged: Some(true),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_doc.len(), 1);
        assert_eq!(by_doc[0].local_path.as_deref(), Some("/tmp/a.txt"));

        let unstaged = db
            .list_files(&FileFilter {
                staged: Some(false),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(unstaged.len(), 2);

        assert_eq!(db.delete_files_for_store(1).unwrap(), 2);
    }
}
