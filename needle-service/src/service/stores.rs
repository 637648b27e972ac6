//! Store and file management.

use std::path::Path;
use tracing::{debug, info, warn};

use crate::db::{FileFilter, Store, StoreFilter, TaskFilter};
use crate::error::{ServiceError, ServiceResult, format_error_chain};
use crate::gateway::RemoteFile;
use crate::service::NeedleService;

impl NeedleService {
    fn require_store(&self, index_id: &str) -> ServiceResult<Store> {
        self.db
            .get_store_by_filter(&StoreFilter::by_index_id(index_id))?
            .ok_or_else(|| ServiceError::StoreNotFound {
                index_id: index_id.to_string(),
            })
    }

    pub fn list_stores(&self, name: Option<&str>) -> ServiceResult<Vec<Store>> {
        self.db.list_stores(name)
    }

    /// Files the remote service holds in the store's category
    pub async fn list_remote_files(&self, index_id: &str) -> ServiceResult<Vec<RemoteFile>> {
        let store = self.require_store(index_id)?;
        let category_id = store.category_id.ok_or_else(|| ServiceError::StoreNotFound {
            index_id: index_id.to_string(),
        })?;

        Ok(self.gateway.list_files(&category_id).await?)
    }

    /// Delete documents from a store's index.
    ///
    /// Returns the ids the remote service confirmed. Local rows and staged
    /// bytes are removed only for confirmed ids.
    pub async fn delete_files(&self, index_id: &str, doc_ids: &[String]) -> ServiceResult<Vec<String>> {
        let store = self.require_store(index_id)?;
        let deleted = self.gateway.delete_files(index_id, doc_ids).await?;

        for doc_id in &deleted {
            if let Err(e) = self.forget_document(store.id, doc_id).await {
                warn!(
                    index_id = %index_id,
                    doc_id = %doc_id,
                    error = %format_error_chain(&e),
                    "Failed to remove local file record"
                );
            }
        }

        info!(
            index_id = %index_id,
            requested = doc_ids.len(),
            deleted = deleted.len(),
            "Deleted files"
        );
        Ok(deleted)
    }

    async fn forget_document(&self, store_id: i64, doc_id: &str) -> ServiceResult<()> {
        let files = self.db.list_files(&FileFilter {
            store_id: Some(store_id),
            doc_id: Some(doc_id.to_string()),
            ..Default::default()
        })?;

        for file in files {
            if let Some(path) = &file.local_path {
                self.staging.remove_file(Path::new(path)).await?;
            }
            self.db.delete_file(file.id)?;
        }
        Ok(())
    }

    /// Delete stores remotely, then locally per the `stores.cascade_delete` policy.
    ///
    /// Unknown ids and remote failures are skipped. Returns the ids the
    /// remote service deleted.
    pub async fn delete_stores(&self, index_ids: &[String]) -> ServiceResult<Vec<String>> {
        let cascade = self.runtime_config.dynamic().stores.cascade_delete;
        let mut deleted = Vec::new();

        for index_id in index_ids {
            let Some(store) = self
                .db
                .get_store_by_filter(&StoreFilter::by_index_id(index_id))?
            else {
                debug!(index_id = %index_id, "Skipping unknown store");
                continue;
            };

            if let Err(e) = self.gateway.delete_store(index_id).await {
                warn!(
                    index_id = %index_id,
                    error = %format_error_chain(&e),
                    "Remote store deletion failed"
                );
                continue;
            }
            deleted.push(index_id.clone());

            let local = if cascade {
                self.purge_store(&store).await
            } else {
                self.db.delete_store(store.id).map(|_| ())
            };

            match local {
                Ok(()) => info!(index_id = %index_id, cascade, "Deleted store"),
                Err(e) => warn!(
                    index_id = %index_id,
                    error = %format_error_chain(&e),
                    "Store deleted remotely but local cleanup failed"
                ),
            }
        }

        Ok(deleted)
    }

    /// Remove the store with its files, tasks and file tasks
    async fn purge_store(&self, store: &Store) -> ServiceResult<()> {
        let tasks = self.db.list_tasks(&TaskFilter {
            store_id: Some(store.id),
            ..Default::default()
        })?;
        for task in &tasks {
            self.staging.remove_task_dir(&task.task_id).await?;
        }

        // file tasks are found through their tasks, so they go first
        self.db.delete_file_tasks_for_store(store.id)?;
        self.db.delete_tasks_for_store(store.id)?;
        self.db.delete_files_for_store(store.id)?;
        self.db.delete_store(store.id)?;
        Ok(())
    }

    /// Staged content of a document, decoded as lossy UTF-8
    pub async fn get_file_content(&self, doc_id: &str) -> ServiceResult<String> {
        let files = self.db.list_files(&FileFilter {
            doc_id: Some(doc_id.to_string()),
            staged: Some(true),
            ..Default::default()
        })?;

        let path = files
            .into_iter()
            .find_map(|file| file.local_path.filter(|path| !path.is_empty()))
            .ok_or_else(|| ServiceError::FileNotFound {
                doc_id: doc_id.to_string(),
            })?;

        let bytes = self.staging.read_bytes(Path::new(&path)).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
