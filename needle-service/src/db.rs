//! Database module for SQLite operations.
//!
//! This module provides the `Database` struct and all database operations
//! organized into submodules by entity. Every method takes the connection
//! lock for a single statement (or a read-back of the row it just wrote), so
//! writes are atomic per row and no lock is ever held across an `.await`.

mod file_tasks;
mod files;
mod migrations;
pub mod models;
mod settings;
mod stores;
mod tasks;

pub use models::{
    FileFilter, FileTask, FileTaskFilter, Store, StoreFile, StoreFilter, Task, TaskFilter,
    TaskKind, TaskStatus,
};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use rusqlite::types::Value;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{DatabaseError, ServiceError, ServiceResult};

/// Database manager for SQLite operations
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database at the given path
    pub fn open(path: &Path) -> ServiceResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ServiceError::Database(DatabaseError::Connection(
                    rusqlite::Error::ToSqlConversionFailure(Box::new(e)),
                ))
            })?;
        }

        let conn = Connection::open(path).map_err(DatabaseError::Connection)?;

        // WAL lets status polls read while a workflow writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(DatabaseError::Query)?;

        Self::from_connection(conn)
    }

    /// Open a private in-memory database
    #[cfg(test)]
    pub fn open_in_memory() -> ServiceResult<Self> {
        let conn = Connection::open_in_memory().map_err(DatabaseError::Connection)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(DatabaseError::Query)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> ServiceResult<Self> {
        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Accumulates `column = ?` clauses for the fields a typed filter sets.
#[derive(Default)]
pub(crate) struct WhereClause {
    clauses: Vec<String>,
    values: Vec<Value>,
}

impl WhereClause {
    pub(crate) fn eq(&mut self, column: &str, value: Option<impl Into<Value>>) -> &mut Self {
        if let Some(value) = value {
            self.values.push(value.into());
            self.clauses
                .push(format!("{} = ?{}", column, self.values.len()));
        }
        self
    }

    pub(crate) fn is_null(&mut self, column: &str, null: Option<bool>) -> &mut Self {
        match null {
            Some(true) => self.clauses.push(format!("{} IS NULL", column)),
            Some(false) => self.clauses.push(format!("{} IS NOT NULL", column)),
            None => {}
        }
        self
    }

    /// ` WHERE a = ?1 AND b = ?2`, or an empty string when nothing is set
    pub(crate) fn sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub(crate) fn params(&self) -> rusqlite::ParamsFromIter<std::slice::Iter<'_, Value>> {
        rusqlite::params_from_iter(self.values.iter())
    }
}

pub(crate) fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_where_clause_only_includes_set_fields() {
        let mut clause = WhereClause::default();
        clause
            .eq("task_id", Some("abc".to_string()))
            .eq("job_id", None::<String>)
            .eq("store_id", Some(7i64))
            .is_null("doc_id", Some(true));

        assert_eq!(
            clause.sql(),
            " WHERE task_id = ?1 AND store_id = ?2 AND doc_id IS NULL"
        );
        assert_eq!(clause.values.len(), 2);
    }

    #[test]
    fn test_empty_where_clause() {
        let clause = WhereClause::default();
        assert_eq!(clause.sql(), "");
    }
}
