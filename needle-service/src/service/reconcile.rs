//! On-demand task status reconciliation.
//!
//! A status poll pulls the remote index job's state, merges the per-document
//! statuses into the task's file tasks and persists the task before
//! answering. Tasks without a job id are answered from local state.

use serde::Serialize;
use tracing::{debug, warn};

use crate::db::{FileTask, Task, TaskFilter, TaskStatus};
use crate::error::{ServiceError, ServiceResult, format_error_chain};
use crate::service::NeedleService;

/// Aggregated view of a task and its file tasks
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusView {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Index id of the store, once created
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_id: Option<String>,
    pub documents: Vec<DocumentView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentView {
    pub doc_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TaskStatusView {
    fn new(task: Task, file_tasks: Vec<FileTask>) -> Self {
        Self {
            task_id: task.task_id,
            status: task.status,
            message: task.message,
            store_id: task.index_id,
            documents: file_tasks
                .into_iter()
                .map(|file_task| DocumentView {
                    doc_name: file_task.doc_name,
                    doc_id: file_task.doc_id,
                    status: file_task.status,
                    message: file_task.message,
                })
                .collect(),
        }
    }
}

impl NeedleService {
    pub async fn get_task_status(&self, task_id: &str) -> ServiceResult<TaskStatusView> {
        let mut task = self
            .db
            .get_task_by_filter(&TaskFilter::by_task_id(task_id))?
            .ok_or_else(|| ServiceError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;

        // A completed task has nothing left to learn from the job
        if task.status != TaskStatus::Completed {
            if let (Some(index_id), Some(job_id)) = (task.index_id.clone(), task.job_id.clone()) {
                task = self.reconcile(task, &index_id, &job_id).await?;
            }
        }

        let file_tasks = self.db.list_file_tasks_by_task(task_id)?;
        Ok(TaskStatusView::new(task, file_tasks))
    }

    async fn reconcile(&self, mut task: Task, index_id: &str, job_id: &str) -> ServiceResult<Task> {
        let documents = match self.gateway.get_job_status(index_id, job_id).await {
            Ok(job) => {
                debug!(
                    task_id = %task.task_id,
                    job_id = %job_id,
                    status = %job.status,
                    documents = job.documents.len(),
                    "Reconciled index job"
                );

                task.status = TaskStatus::from_remote(&job.status);
                if job.message.is_some() {
                    task.message = job.message;
                }
                job.documents
            }
            Err(e) => {
                let message = format!("Failed to query index job status: {}", format_error_chain(&e));
                warn!(task_id = %task.task_id, job_id = %job_id, error = %message, "Reconciliation failed");

                task.status = TaskStatus::Failed;
                task.message = Some(message);
                Vec::new()
            }
        };

        // The task may have been deleted with its store during the remote call
        let task = self
            .db
            .update_task(&task)?
            .ok_or_else(|| ServiceError::TaskNotFound {
                task_id: task.task_id.clone(),
            })?;

        for document in &documents {
            self.db.merge_file_task_status(
                &task.task_id,
                &document.doc_id,
                &document.doc_name,
                TaskStatus::from_remote(&document.status),
                document.message.as_deref(),
            )?;
        }

        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TaskKind;
    use crate::service::testing::{FakeGateway, test_service};
    use crate::service::{CreateStoreRequest, UploadFile};
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    async fn create_store(
        service: &Arc<NeedleService>,
        task_id: &str,
        file_names: &[&str],
    ) -> Task {
        let task = service
            .db
            .create_task(task_id, TaskKind::CreateStore, TaskStatus::Running)
            .unwrap();
        let request = CreateStoreRequest {
            name: "demo".to_string(),
            files: file_names
                .iter()
                .map(|name| UploadFile {
                    name: name.to_string(),
                    content: format!("content of {}", name).into_bytes(),
                })
                .collect(),
            ..Default::default()
        };
        service.run_create_store(task, request).await;
        service
            .db
            .get_task_by_filter(&TaskFilter::by_task_id(task_id))
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_demo_store_completes_on_first_poll() {
        let fake = Arc::new(FakeGateway::default());
        fake.set_job_state("COMPLETED", "FINISH");
        let (service, _temp) = test_service(fake.clone());

        let task = create_store(&service, "task-1", &["a.txt"]).await;
        assert_eq!(task.status, TaskStatus::Running);

        let view = service.get_task_status("task-1").await.unwrap();
        assert_eq!(view.status, TaskStatus::Completed);
        assert_eq!(view.store_id, task.index_id);
        assert_eq!(view.documents.len(), 1);
        assert_eq!(view.documents[0].doc_name, "a.txt");
        assert_eq!(view.documents[0].status, TaskStatus::from_remote("FINISH"));
    }

    #[tokio::test]
    async fn test_status_without_job_is_local() {
        let fake = Arc::new(FakeGateway::default());
        let (service, _temp) = test_service(fake.clone());

        service
            .db
            .create_task("task-1", TaskKind::CreateStore, TaskStatus::Running)
            .unwrap();

        let view = service.get_task_status("task-1").await.unwrap();
        assert_eq!(view.status, TaskStatus::Running);
        assert!(view.documents.is_empty());
        assert_eq!(fake.job_status_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let (service, _temp) = test_service(Arc::new(FakeGateway::default()));

        let result = service.get_task_status("nope").await;
        assert!(matches!(result, Err(ServiceError::TaskNotFound { .. })));
    }

    #[tokio::test]
    async fn test_repeated_polls_are_identical() {
        let fake = Arc::new(FakeGateway::default());
        fake.set_job_state("RUNNING", "PARSING");
        let (service, _temp) = test_service(fake.clone());

        create_store(&service, "task-1", &["a.txt", "b.txt"]).await;

        let first = service.get_task_status("task-1").await.unwrap();
        let second = service.get_task_status("task-1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.status, TaskStatus::Running);
        assert_eq!(first.documents.len(), 2);
    }

    #[tokio::test]
    async fn test_partial_progress_is_visible() {
        let fake = Arc::new(FakeGateway {
            fail_lease_for: ["b.txt".to_string()].into_iter().collect(),
            ..Default::default()
        });
        fake.set_job_state("RUNNING", "FINISH");
        let (service, _temp) = test_service(fake.clone());

        create_store(&service, "task-1", &["a.txt", "b.txt"]).await;

        let view = service.get_task_status("task-1").await.unwrap();
        assert_eq!(view.status, TaskStatus::Running);
        assert_eq!(view.documents.len(), 2);
        assert_eq!(view.documents[0].status, TaskStatus::Completed);
        assert_eq!(view.documents[1].status, TaskStatus::Failed);
        assert!(view.documents[1].doc_id.is_none());
    }

    #[tokio::test]
    async fn test_gateway_error_fails_task() {
        let fake = Arc::new(FakeGateway::default());
        fake.set_job_state("RUNNING", "PARSING");
        let (service, _temp) = test_service(fake.clone());

        create_store(&service, "task-1", &["a.txt"]).await;
        *fake.fail_job_status.lock().unwrap() = true;

        let view = service.get_task_status("task-1").await.unwrap();
        assert_eq!(view.status, TaskStatus::Failed);
        assert!(view.message.unwrap().contains("GetIndexJobStatus"));
    }

    #[tokio::test]
    async fn test_store_deleted_during_poll_stays_deleted() {
        let fake = Arc::new(FakeGateway::default());
        fake.set_job_state("COMPLETED", "FINISH");
        let (service, _temp) = test_service(fake.clone());

        let task = create_store(&service, "task-1", &["a.txt"]).await;
        let store_id = task.store_id.unwrap();

        // the cascade lands while the job status request is in flight
        let db = service.db.clone();
        *fake.before_job_status.lock().unwrap() = Some(Box::new(move || {
            db.delete_file_tasks_for_store(store_id).unwrap();
            db.delete_tasks_for_store(store_id).unwrap();
        }));

        let result = service.get_task_status("task-1").await;
        assert!(matches!(result, Err(ServiceError::TaskNotFound { .. })));
        assert_eq!(fake.job_status_calls.load(Ordering::SeqCst), 1);

        assert!(
            service
                .db
                .get_task_by_filter(&TaskFilter::by_task_id("task-1"))
                .unwrap()
                .is_none()
        );
        assert!(service.db.list_file_tasks_by_task("task-1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_status_never_reverts() {
        let fake = Arc::new(FakeGateway::default());
        fake.set_job_state("COMPLETED", "FINISH");
        let (service, _temp) = test_service(fake.clone());

        create_store(&service, "task-1", &["a.txt"]).await;
        assert_eq!(
            service.get_task_status("task-1").await.unwrap().status,
            TaskStatus::Completed
        );

        fake.set_job_state("RUNNING", "PARSING");
        assert_eq!(
            service.get_task_status("task-1").await.unwrap().status,
            TaskStatus::Completed
        );

        // a failed task keeps absorbing document state but stays failed
        create_store(&service, "task-2", &["b.txt"]).await;
        *fake.fail_job_status.lock().unwrap() = true;
        assert_eq!(
            service.get_task_status("task-2").await.unwrap().status,
            TaskStatus::Failed
        );

        *fake.fail_job_status.lock().unwrap() = false;
        fake.set_job_state("RUNNING", "FINISH");
        let view = service.get_task_status("task-2").await.unwrap();
        assert_eq!(view.status, TaskStatus::Failed);
        assert!(view.documents.iter().any(|d| d.status == TaskStatus::Completed));
    }
}
