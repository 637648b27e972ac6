//! Remote indexing service gateway.
//!
//! The orchestrator, reconciler and fan-out only see [`IndexingGateway`];
//! the HTTP implementation lives in [`http`]. Every operation is a single
//! remote call with no retries, and any failure (transport or
//! application-level) comes back as a [`GatewayError`].

pub mod http;

pub use http::HttpIndexingGateway;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::GatewayError;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Parameters for creating a search index over a category.
///
/// Unset chunking options are omitted from the request entirely so the
/// remote service applies its own defaults.
#[derive(Debug, Clone, Default)]
pub struct CreateIndexRequest {
    pub name: String,
    pub category_id: String,
    pub chunk_size: Option<u32>,
    pub overlap_size: Option<u32>,
    pub separator: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UploadLeaseRequest {
    pub file_name: String,
    pub checksum: String,
    pub size_in_bytes: u64,
}

/// Where and how to upload the bytes for one file
#[derive(Debug, Clone)]
pub struct UploadLease {
    pub lease_id: String,
    pub url: String,
    pub headers: HashMap<String, String>,
}

/// Status of one document inside an index job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentStatus {
    pub doc_id: String,
    pub doc_name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub documents: Vec<DocumentStatus>,
}

/// A file as listed by the remote data center
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteFile {
    pub doc_id: String,
    pub doc_name: String,
    pub status: String,
}

/// Per-store retrieve parameters, already resolved against defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveParams {
    pub query: String,
    pub top_k: u32,
    pub rerank_top_k: u32,
    pub sparse_top_k: u32,
    pub min_score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Vec<HashMap<String, String>>>,
}

/// A retrieved text chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait IndexingGateway: Send + Sync {
    /// Create a category; returns its id
    async fn add_category(&self, name: &str) -> GatewayResult<String>;

    /// Create an index over a category; returns the index id
    async fn create_index(&self, request: &CreateIndexRequest) -> GatewayResult<String>;

    async fn apply_upload_lease(
        &self,
        category_id: &str,
        request: &UploadLeaseRequest,
    ) -> GatewayResult<UploadLease>;

    /// PUT raw bytes to a lease destination
    async fn put_bytes(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        content: Vec<u8>,
    ) -> GatewayResult<()>;

    /// Register an uploaded lease as a file; returns the document id
    async fn register_file(&self, category_id: &str, lease_id: &str) -> GatewayResult<String>;

    /// Start indexing the given documents; returns the job id
    async fn submit_index_job(
        &self,
        index_id: &str,
        document_ids: &[String],
    ) -> GatewayResult<String>;

    async fn get_job_status(&self, index_id: &str, job_id: &str) -> GatewayResult<JobStatus>;

    async fn list_files(&self, category_id: &str) -> GatewayResult<Vec<RemoteFile>>;

    /// Remove documents from an index; returns the ids actually deleted
    async fn delete_files(&self, index_id: &str, doc_ids: &[String])
    -> GatewayResult<Vec<String>>;

    async fn delete_store(&self, index_id: &str) -> GatewayResult<()>;

    async fn retrieve(&self, index_id: &str, params: &RetrieveParams) -> GatewayResult<Vec<Chunk>>;
}
