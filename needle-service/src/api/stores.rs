//! Store and file API endpoints.
//!
//! File contents travel base64-encoded in JSON bodies and are validated
//! against the `limits` settings before any workflow starts.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::LimitsConfig;
use crate::db::Store;
use crate::error::{ServiceError, ServiceResult};
use crate::gateway::RemoteFile;
use crate::service::{CreateStoreRequest, UploadFile};

use super::AppState;

/// A file as sent by clients
#[derive(Deserialize)]
pub struct FilePayload {
    pub name: String,
    /// Base64-encoded bytes
    pub content: String,
}

#[derive(Deserialize)]
pub struct CreateStoreBody {
    pub name: String,
    pub chunk_size: Option<u32>,
    pub overlap_size: Option<u32>,
    pub separator: Option<String>,
    #[serde(default)]
    pub files: Vec<FilePayload>,
}

#[derive(Deserialize)]
pub struct AddFilesBody {
    #[serde(default)]
    pub files: Vec<FilePayload>,
}

#[derive(Deserialize)]
pub struct ListStoresParams {
    pub name: Option<String>,
}

#[derive(Deserialize)]
pub struct DeleteStoresBody {
    pub ids: Vec<String>,
}

#[derive(Deserialize)]
pub struct DeleteFilesBody {
    pub file_ids: Vec<String>,
}

/// Response for workflow-starting endpoints
#[derive(Serialize)]
pub struct TaskCreatedResponse {
    pub task_id: String,
}

/// Response for delete operations
#[derive(Serialize)]
pub struct DeletedResponse {
    pub deleted: Vec<String>,
}

fn invalid(message: impl Into<String>) -> ServiceError {
    ServiceError::InvalidRequest {
        message: message.into(),
    }
}

/// Decode and check uploaded files
fn decode_files(files: Vec<FilePayload>, limits: &LimitsConfig) -> ServiceResult<Vec<UploadFile>> {
    if files.len() > limits.max_files_per_request {
        return Err(invalid(format!(
            "Too many files: {} (max {})",
            files.len(),
            limits.max_files_per_request
        )));
    }

    files
        .into_iter()
        .map(|file| {
            if file.name.trim().is_empty() {
                return Err(invalid("File name must not be empty"));
            }

            let content = STANDARD
                .decode(file.content.as_bytes())
                .map_err(|e| invalid(format!("File {} is not valid base64: {}", file.name, e)))?;

            if content.len() as u64 > limits.max_file_size_bytes {
                return Err(invalid(format!(
                    "File {} is {} bytes (max {})",
                    file.name,
                    content.len(),
                    limits.max_file_size_bytes
                )));
            }

            Ok(UploadFile {
                name: file.name,
                content,
            })
        })
        .collect()
}

/// Start a create-store workflow
pub async fn create_store_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateStoreBody>,
) -> Result<Json<TaskCreatedResponse>, ServiceError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(invalid("Store name must not be empty"));
    }

    let limits = state.service.runtime_config.dynamic().limits.clone();
    let files = decode_files(body.files, &limits)?;

    let task_id = state.service.start_create_store(CreateStoreRequest {
        name: name.to_string(),
        chunk_size: body.chunk_size,
        overlap_size: body.overlap_size,
        separator: body.separator,
        files,
    })?;

    Ok(Json(TaskCreatedResponse { task_id }))
}

/// List local stores, optionally by name substring
pub async fn list_stores_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListStoresParams>,
) -> Result<Json<Vec<Store>>, ServiceError> {
    let stores = state.service.list_stores(params.name.as_deref())?;
    Ok(Json(stores))
}

pub async fn delete_stores_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DeleteStoresBody>,
) -> Result<Json<DeletedResponse>, ServiceError> {
    let deleted = state.service.delete_stores(&body.ids).await?;
    Ok(Json(DeletedResponse { deleted }))
}

/// Start an add-files workflow
pub async fn add_files_handler(
    State(state): State<Arc<AppState>>,
    Path(index_id): Path<String>,
    Json(body): Json<AddFilesBody>,
) -> Result<Json<TaskCreatedResponse>, ServiceError> {
    let limits = state.service.runtime_config.dynamic().limits.clone();
    let files = decode_files(body.files, &limits)?;

    let task_id = state.service.start_add_files(&index_id, files)?;
    Ok(Json(TaskCreatedResponse { task_id }))
}

pub async fn list_files_handler(
    State(state): State<Arc<AppState>>,
    Path(index_id): Path<String>,
) -> Result<Json<Vec<RemoteFile>>, ServiceError> {
    let files = state.service.list_remote_files(&index_id).await?;
    Ok(Json(files))
}

pub async fn delete_files_handler(
    State(state): State<Arc<AppState>>,
    Path(index_id): Path<String>,
    Json(body): Json<DeleteFilesBody>,
) -> Result<Json<DeletedResponse>, ServiceError> {
    let deleted = state.service.delete_files(&index_id, &body.file_ids).await?;
    Ok(Json(DeletedResponse { deleted }))
}

/// Staged file content as text
pub async fn file_content_handler(
    State(state): State<Arc<AppState>>,
    Path(doc_id): Path<String>,
) -> Result<String, ServiceError> {
    state.service.get_file_content(&doc_id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(name: &str, content: &[u8]) -> FilePayload {
        FilePayload {
            name: name.to_string(),
            content: STANDARD.encode(content),
        }
    }

    #[test]
    fn test_decode_files() {
        let limits = LimitsConfig::default();
        let files = decode_files(vec![payload("a.txt", b"alpha")], &limits).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].content, b"alpha");
    }

    #[test]
    fn test_decode_files_enforces_limits() {
        let limits = LimitsConfig {
            max_file_size_bytes: 4,
            max_files_per_request: 1,
        };

        let too_big = decode_files(vec![payload("a.txt", b"alpha")], &limits);
        assert!(matches!(too_big, Err(ServiceError::InvalidRequest { .. })));

        let too_many = decode_files(vec![payload("a", b"a"), payload("b", b"b")], &limits);
        assert!(matches!(too_many, Err(ServiceError::InvalidRequest { .. })));

        let unnamed = decode_files(vec![payload("  ", b"a")], &limits);
        assert!(matches!(unnamed, Err(ServiceError::InvalidRequest { .. })));
    }
}
