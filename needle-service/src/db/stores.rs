//! Store operations.

use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::models::{Store, StoreFilter};
use super::{Database, WhereClause};
use crate::error::{DatabaseError, ServiceResult};

impl Database {
    /// Insert a store shell; remote ids are filled in as the workflow proceeds
    pub fn insert_store(&self, name: &str) -> ServiceResult<Store> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO stores (name, created_at, updated_at) VALUES (?1, ?2, ?2)",
            params![name, now.to_rfc3339()],
        )
        .map_err(DatabaseError::Query)?;

        Ok(Store {
            id: conn.last_insert_rowid(),
            name: name.to_string(),
            category_id: None,
            index_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Persist a store's remote ids
    pub fn update_store(&self, store: &Store) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "UPDATE stores SET name = ?1, category_id = ?2, index_id = ?3, updated_at = ?4 WHERE id = ?5",
            params![
                store.name,
                store.category_id,
                store.index_id,
                Utc::now().to_rfc3339(),
                store.id,
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    pub fn get_store_by_filter(&self, filter: &StoreFilter) -> ServiceResult<Option<Store>> {
        let conn = self.conn.lock().unwrap();

        let mut clause = WhereClause::default();
        clause
            .eq("id", filter.id)
            .eq("index_id", filter.index_id.clone())
            .eq("category_id", filter.category_id.clone());

        let sql = format!(
            "SELECT {} FROM stores{} ORDER BY id LIMIT 1",
            Store::COLUMNS,
            clause.sql()
        );

        conn.query_row(&sql, clause.params(), Store::from_row)
            .optional()
            .map_err(|e| DatabaseError::Query(e).into())
    }

    /// List stores that finished creation, optionally filtered by name substring
    pub fn list_stores(&self, name: Option<&str>) -> ServiceResult<Vec<Store>> {
        let conn = self.conn.lock().unwrap();

        let sql = format!(
            "SELECT {} FROM stores WHERE index_id IS NOT NULL AND (?1 IS NULL OR name LIKE '%' || ?1 || '%') ORDER BY created_at DESC, id DESC",
            Store::COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(DatabaseError::Query)?;

        let stores = stmt
            .query_map(params![name], Store::from_row)
            .map_err(DatabaseError::Query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(DatabaseError::Query)?;

        Ok(stores)
    }

    pub fn delete_store(&self, id: i64) -> ServiceResult<bool> {
        let conn = self.conn.lock().unwrap();

        let count = conn
            .execute("DELETE FROM stores WHERE id = ?1", params![id])
            .map_err(DatabaseError::Query)?;

        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        let mut store = db.insert_store("demo").unwrap();

        // shells are not listed until the index exists
        assert!(db.list_stores(None).unwrap().is_empty());

        store.category_id = Some("cat-1".to_string());
        store.index_id = Some("idx-1".to_string());
        db.update_store(&store).unwrap();

        let found = db
            .get_store_by_filter(&StoreFilter::by_index_id("idx-1"))
            .unwrap()
            .unwrap();
        assert_eq!(found.id, store.id);
        assert_eq!(found.category_id.as_deref(), Some("cat-1"));

        assert_eq!(db.list_stores(Some("em")).unwrap().len(), 1);
        assert!(db.list_stores(Some("other")).unwrap().is_empty());

        assert!(db.delete_store(store.id).unwrap());
        assert!(
            db.get_store_by_filter(&StoreFilter::by_index_id("idx-1"))
                .unwrap()
                .is_none()
        );
    }
}
