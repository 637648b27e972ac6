//! Settings storage operations.
//!
//! Runtime overrides for `DynamicConfig`, stored as one JSON value per key.

use std::collections::HashMap;

use chrono::Utc;
use rusqlite::params;

use super::Database;
use crate::error::{DatabaseError, ServiceResult};

impl Database {
    /// Get all settings as a map
    pub fn get_all_settings(&self) -> ServiceResult<HashMap<String, serde_json::Value>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare("SELECT key, value FROM settings")
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map([], |row| {
                let key: String = row.get(0)?;
                let value_str: String = row.get(1)?;
                Ok((key, value_str))
            })
            .map_err(DatabaseError::Query)?;

        let mut settings = HashMap::new();
        for row in rows {
            let (key, value_str) = row.map_err(DatabaseError::Query)?;
            match serde_json::from_str(&value_str) {
                Ok(value) => {
                    settings.insert(key, value);
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Ignoring unparseable setting");
                }
            }
        }

        Ok(settings)
    }

    /// Set multiple settings.
    /// Null values delete the setting (revert to default)
    pub fn set_settings(&self, settings: &HashMap<String, serde_json::Value>) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();

        for (key, value) in settings {
            if value.is_null() {
                conn.execute("DELETE FROM settings WHERE key = ?1", params![key])
                    .map_err(DatabaseError::Query)?;
            } else {
                let value_str =
                    serde_json::to_string(value).map_err(DatabaseError::Serialization)?;
                conn.execute(
                    "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    params![key, value_str, now],
                )
                .map_err(DatabaseError::Query)?;
            }
        }

        Ok(())
    }
}
