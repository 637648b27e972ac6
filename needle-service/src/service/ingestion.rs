//! Create-store and add-files workflows.
//!
//! Both return a task id as soon as the task row exists and run the
//! remote calls on a detached tokio task. Category and index failures fail
//! the whole task; a failure while uploading one file only fails that
//! file's sub-task. Completion of the index job is discovered later by the
//! reconciler.

use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{FileTask, Store, StoreFile, StoreFilter, Task, TaskKind, TaskStatus};
use crate::error::{ServiceError, ServiceResult, format_error_chain};
use crate::gateway::{CreateIndexRequest, UploadLeaseRequest};
use crate::service::NeedleService;

/// A file to ingest, already decoded
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateStoreRequest {
    pub name: String,
    pub chunk_size: Option<u32>,
    pub overlap_size: Option<u32>,
    pub separator: Option<String>,
    pub files: Vec<UploadFile>,
}

impl NeedleService {
    /// Start the create-store workflow and return its task id
    pub fn start_create_store(
        self: &Arc<Self>,
        request: CreateStoreRequest,
    ) -> ServiceResult<String> {
        let task_id = Uuid::new_v4().to_string();
        let task = self
            .db
            .create_task(&task_id, TaskKind::CreateStore, TaskStatus::Running)?;

        info!(
            task_id = %task_id,
            name = %request.name,
            files = request.files.len(),
            "Create store task started"
        );

        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.run_create_store(task, request).await;
        });

        Ok(task_id)
    }

    /// Start the add-files workflow against an existing store
    pub fn start_add_files(
        self: &Arc<Self>,
        index_id: &str,
        files: Vec<UploadFile>,
    ) -> ServiceResult<String> {
        let store = self
            .db
            .get_store_by_filter(&StoreFilter::by_index_id(index_id))?
            .ok_or_else(|| ServiceError::StoreNotFound {
                index_id: index_id.to_string(),
            })?;

        let task_id = Uuid::new_v4().to_string();
        let mut task = self
            .db
            .create_task(&task_id, TaskKind::AddFiles, TaskStatus::Running)?;
        task.store_id = Some(store.id);
        task.index_id = store.index_id.clone();
        let task = self.db.upsert_task(&task)?;

        info!(
            task_id = %task_id,
            index_id = %index_id,
            files = files.len(),
            "Add files task started"
        );

        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.run_add_files(task, store, files).await;
        });

        Ok(task_id)
    }

    pub(crate) async fn run_create_store(&self, mut task: Task, request: CreateStoreRequest) {
        let result = self.create_store_workflow(&mut task, request).await;
        self.finish_workflow(task, result, "Create store");
    }

    pub(crate) async fn run_add_files(&self, mut task: Task, store: Store, files: Vec<UploadFile>) {
        let result = self.ingest_files(&mut task, &store, files).await;
        self.finish_workflow(task, result, "Add files");
    }

    /// Record a workflow-level failure on the task
    fn finish_workflow(&self, mut task: Task, result: ServiceResult<()>, workflow: &str) {
        let Err(e) = result else {
            return;
        };

        let message = format!("{} failed: {}", workflow, format_error_chain(&e));
        error!(task_id = %task.task_id, error = %message, "Workflow failed");

        task.status = TaskStatus::Failed;
        task.message = Some(message);
        if let Err(e) = self.db.upsert_task(&task) {
            error!(task_id = %task.task_id, error = %e, "Failed to record task failure");
        }
    }

    async fn create_store_workflow(
        &self,
        task: &mut Task,
        request: CreateStoreRequest,
    ) -> ServiceResult<()> {
        let mut store = self.db.insert_store(&request.name)?;
        task.store_id = Some(store.id);
        *task = self.db.upsert_task(task)?;

        let category_id = self.gateway.add_category(&request.name).await?;
        store.category_id = Some(category_id.clone());
        self.db.update_store(&store)?;
        info!(task_id = %task.task_id, category_id = %category_id, "Category created");

        let index_id = self
            .gateway
            .create_index(&CreateIndexRequest {
                name: request.name.clone(),
                category_id,
                chunk_size: request.chunk_size,
                overlap_size: request.overlap_size,
                separator: request.separator.clone(),
            })
            .await?;
        store.index_id = Some(index_id.clone());
        self.db.update_store(&store)?;
        task.index_id = Some(index_id.clone());
        *task = self.db.upsert_task(task)?;
        info!(task_id = %task.task_id, index_id = %index_id, "Index created");

        self.ingest_files(task, &store, request.files).await
    }

    /// Upload every file, then submit one index job for those that registered
    async fn ingest_files(
        &self,
        task: &mut Task,
        store: &Store,
        files: Vec<UploadFile>,
    ) -> ServiceResult<()> {
        let (Some(category_id), Some(index_id)) =
            (store.category_id.as_deref(), store.index_id.as_deref())
        else {
            return Err(ServiceError::Internal {
                message: format!("store {} has no category or index", store.id),
            });
        };

        let total = files.len();
        let mut doc_ids = Vec::new();

        for file in files {
            let record = self.db.insert_file(store.id, &file.name)?;
            let mut file_task = FileTask::new(&task.task_id, &file.name);
            file_task.file_id = Some(record.id);
            file_task.status = TaskStatus::Running;
            let mut file_task = self.db.upsert_file_task(&file_task)?;

            match self
                .upload_file(&task.task_id, category_id, record, &file)
                .await
            {
                Ok(doc_id) => {
                    info!(task_id = %task.task_id, file = %file.name, doc_id = %doc_id, "File registered");
                    file_task.doc_id = Some(doc_id.clone());
                    doc_ids.push(doc_id);
                }
                Err(e) => {
                    let message = format_error_chain(&e);
                    warn!(task_id = %task.task_id, file = %file.name, error = %message, "File upload failed");
                    file_task.status = TaskStatus::Failed;
                    file_task.message = Some(message);
                }
            }

            self.db.upsert_file_task(&file_task)?;
        }

        if doc_ids.is_empty() {
            task.status = TaskStatus::Completed;
            if total > 0 {
                task.message = Some(format!("None of the {} files could be registered", total));
            }
            *task = self.db.upsert_task(task)?;
            info!(task_id = %task.task_id, "Task completed without an index job");
            return Ok(());
        }

        let job_id = self.gateway.submit_index_job(index_id, &doc_ids).await?;
        task.job_id = Some(job_id.clone());
        *task = self.db.upsert_task(task)?;

        info!(
            task_id = %task.task_id,
            job_id = %job_id,
            registered = doc_ids.len(),
            total,
            "Index job submitted"
        );

        Ok(())
    }

    /// Stage, lease, upload and register one file; returns its document id
    async fn upload_file(
        &self,
        task_id: &str,
        category_id: &str,
        mut record: StoreFile,
        file: &UploadFile,
    ) -> ServiceResult<String> {
        let path = self
            .staging
            .stage_bytes(task_id, record.id, &file.name, &file.content)
            .await?;
        record.local_path = Some(path.to_string_lossy().to_string());
        self.db.update_file(&record)?;

        let checksum = self.staging.checksum(&path).await?;
        let lease = self
            .gateway
            .apply_upload_lease(
                category_id,
                &UploadLeaseRequest {
                    file_name: file.name.clone(),
                    checksum,
                    size_in_bytes: file.content.len() as u64,
                },
            )
            .await?;

        let content = self.staging.read_bytes(&path).await?;
        self.gateway
            .put_bytes(&lease.url, &lease.headers, content)
            .await?;

        let doc_id = self
            .gateway
            .register_file(category_id, &lease.lease_id)
            .await?;
        record.doc_id = Some(doc_id.clone());
        self.db.update_file(&record)?;

        Ok(doc_id)
    }
}
