//! HTTP client for the remote indexing service.
//!
//! Requests are scoped to one workspace (`{endpoint}/{workspace_id}/...`) and
//! authenticated with a bearer token. Every JSON response is wrapped in an
//! envelope `{ Success, Code, Message, Data }`.

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use super::{
    Chunk, CreateIndexRequest, DocumentStatus, GatewayResult, IndexingGateway, JobStatus,
    RemoteFile, RetrieveParams, UploadLease, UploadLeaseRequest,
};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, ServiceError, ServiceResult};

pub struct HttpIndexingGateway {
    client: Client,
    config: GatewayConfig,
}

impl HttpIndexingGateway {
    pub fn new(config: GatewayConfig) -> ServiceResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| {
                ServiceError::Gateway(GatewayError::Connection {
                    url: config.endpoint.clone(),
                    source: e,
                })
            })?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}{}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.workspace_id,
            path
        )
    }

    /// Send one request and unwrap the response envelope
    async fn send<B, T>(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: &B,
    ) -> GatewayResult<Option<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        debug!(operation, url = %url, "Calling indexing service");

        let mut request = self.client.request(method, &url).json(body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Connection {
                url: url.clone(),
                source: e,
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::Connection {
                url: url.clone(),
                source: e,
            })?;

        decode_envelope(operation, status.as_u16(), &text)
    }

    /// Like [`Self::send`], for operations whose `Data` is required
    async fn call<B, T>(
        &self,
        operation: &'static str,
        method: Method,
        path: &str,
        body: &B,
    ) -> GatewayResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.send(operation, method, path, body)
            .await?
            .ok_or(GatewayError::MissingField {
                operation,
                field: "Data",
            })
    }
}

/// Turn a raw response into its `Data` payload.
///
/// A non-2xx status or `Success: false` is an API error even when the body
/// parses.
fn decode_envelope<T: DeserializeOwned>(
    operation: &'static str,
    status: u16,
    text: &str,
) -> GatewayResult<Option<T>> {
    let envelope: Result<Envelope<T>, _> = serde_json::from_str(text);

    match envelope {
        Ok(envelope) if (200..300).contains(&status) && envelope.success => Ok(envelope.data),
        Ok(envelope) => Err(GatewayError::Api {
            operation,
            status,
            code: envelope.code.unwrap_or_default(),
            message: envelope.message.unwrap_or_default(),
        }),
        Err(_) if !(200..300).contains(&status) => Err(GatewayError::Api {
            operation,
            status,
            code: String::new(),
            message: text.chars().take(512).collect(),
        }),
        Err(source) => Err(GatewayError::InvalidResponse { operation, source }),
    }
}

#[async_trait]
impl IndexingGateway for HttpIndexingGateway {
    async fn add_category(&self, name: &str) -> GatewayResult<String> {
        let body = AddCategoryBody {
            category_name: name,
            category_type: "UNSTRUCTURED",
            parent_category_id: &self.config.parent_category_id,
        };

        let data: AddCategoryData = self
            .call("AddCategory", Method::POST, "/datacenter/category", &body)
            .await?;
        Ok(data.category_id)
    }

    async fn create_index(&self, request: &CreateIndexRequest) -> GatewayResult<String> {
        let body = CreateIndexBody {
            name: &request.name,
            structure_type: "unstructured",
            source_type: "DATA_CENTER_CATEGORY",
            sink_type: "DEFAULT",
            category_ids: vec![&request.category_id],
            chunk_size: request.chunk_size,
            overlap_size: request.overlap_size,
            separator: request.separator.as_deref(),
        };

        let data: IdData = self
            .call("CreateIndex", Method::POST, "/index/create", &body)
            .await?;
        Ok(data.id)
    }

    async fn apply_upload_lease(
        &self,
        category_id: &str,
        request: &UploadLeaseRequest,
    ) -> GatewayResult<UploadLease> {
        let body = ApplyLeaseBody {
            file_name: &request.file_name,
            checksum: &request.checksum,
            size_in_bytes: request.size_in_bytes.to_string(),
        };

        let path = format!("/datacenter/category/{}", category_id);
        let data: LeaseData = self
            .call("ApplyFileUploadLease", Method::POST, &path, &body)
            .await?;

        Ok(UploadLease {
            lease_id: data.file_upload_lease_id,
            url: data.param.url,
            headers: data.param.headers,
        })
    }

    async fn put_bytes(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        content: Vec<u8>,
    ) -> GatewayResult<()> {
        let mut request = self.client.put(url).body(content);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Connection {
                url: url.to_string(),
                source: e,
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GatewayError::Api {
                operation: "PutBytes",
                status: status.as_u16(),
                code: String::new(),
                message,
            });
        }

        Ok(())
    }

    async fn register_file(&self, category_id: &str, lease_id: &str) -> GatewayResult<String> {
        let body = AddFileBody {
            lease_id,
            parser: &self.config.parser,
            category_id,
        };

        let data: AddFileData = self
            .call("AddFile", Method::PUT, "/datacenter/file", &body)
            .await?;
        Ok(data.file_id)
    }

    async fn submit_index_job(
        &self,
        index_id: &str,
        document_ids: &[String],
    ) -> GatewayResult<String> {
        let body = SubmitJobBody {
            index_id,
            source_type: "DATA_CENTER_FILE",
            document_ids,
        };

        let data: IdData = self
            .call(
                "SubmitIndexAddDocumentsJob",
                Method::POST,
                "/index/add_documents_to_index",
                &body,
            )
            .await?;
        Ok(data.id)
    }

    async fn get_job_status(&self, index_id: &str, job_id: &str) -> GatewayResult<JobStatus> {
        let body = JobStatusBody { index_id, job_id };

        let data: JobStatusData = self
            .call("GetIndexJobStatus", Method::POST, "/index/job/status", &body)
            .await?;

        Ok(JobStatus {
            status: data.status,
            message: data.message,
            documents: data
                .documents
                .into_iter()
                .map(|doc| DocumentStatus {
                    doc_id: doc.doc_id,
                    doc_name: doc.doc_name,
                    status: doc.status,
                    message: doc.message.filter(|m| !m.is_empty()),
                })
                .collect(),
        })
    }

    async fn list_files(&self, category_id: &str) -> GatewayResult<Vec<RemoteFile>> {
        let body = ListFileBody {
            category_id,
            max_results: 100,
        };

        let data: FileListData = self
            .call("ListFile", Method::POST, "/datacenter/files", &body)
            .await?;

        Ok(data
            .file_list
            .into_iter()
            .map(|file| RemoteFile {
                doc_id: file.file_id,
                doc_name: file.file_name,
                status: file.status,
            })
            .collect())
    }

    async fn delete_files(
        &self,
        index_id: &str,
        doc_ids: &[String],
    ) -> GatewayResult<Vec<String>> {
        let body = DeleteDocumentsBody { index_id, document_ids: doc_ids };

        let data: DeletedDocumentsData = self
            .call(
                "DeleteIndexDocument",
                Method::POST,
                "/index/delete_index_document",
                &body,
            )
            .await?;
        Ok(data.deleted_document)
    }

    async fn delete_store(&self, index_id: &str) -> GatewayResult<()> {
        let body = DeleteIndexBody { index_id };

        self.send::<_, serde_json::Value>("DeleteIndex", Method::POST, "/index/delete", &body)
            .await?;
        Ok(())
    }

    async fn retrieve(&self, index_id: &str, params: &RetrieveParams) -> GatewayResult<Vec<Chunk>> {
        let body = RetrieveBody {
            index_id,
            query: &params.query,
            enable_reranking: true,
            dense_similarity_top_k: params.top_k,
            sparse_similarity_top_k: params.sparse_top_k,
            rerank_top_n: params.rerank_top_k,
            rerank_min_score: params.min_score,
            search_filters: params.filters.as_ref(),
        };

        let data: RetrieveData = self
            .call("Retrieve", Method::POST, "/index/retrieve", &body)
            .await?;

        Ok(data
            .nodes
            .into_iter()
            .map(|node| Chunk {
                text: node.text,
                score: node.score,
                metadata: node.metadata,
            })
            .collect())
    }
}

// Wire types

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AddCategoryBody<'a> {
    category_name: &'a str,
    category_type: &'a str,
    parent_category_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AddCategoryData {
    category_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateIndexBody<'a> {
    name: &'a str,
    structure_type: &'a str,
    source_type: &'a str,
    sink_type: &'a str,
    category_ids: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunk_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    overlap_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    separator: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IdData {
    id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ApplyLeaseBody<'a> {
    file_name: &'a str,
    checksum: &'a str,
    size_in_bytes: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LeaseData {
    file_upload_lease_id: String,
    param: LeaseParam,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LeaseParam {
    url: String,
    #[serde(default)]
    headers: HashMap<String, String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AddFileBody<'a> {
    lease_id: &'a str,
    parser: &'a str,
    category_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AddFileData {
    file_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SubmitJobBody<'a> {
    index_id: &'a str,
    source_type: &'a str,
    document_ids: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct JobStatusBody<'a> {
    index_id: &'a str,
    job_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JobStatusData {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    documents: Vec<JobDocument>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JobDocument {
    doc_id: String,
    #[serde(default)]
    doc_name: String,
    status: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ListFileBody<'a> {
    category_id: &'a str,
    max_results: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FileListData {
    #[serde(default)]
    file_list: Vec<FileListItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FileListItem {
    file_id: String,
    file_name: String,
    status: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DeleteDocumentsBody<'a> {
    index_id: &'a str,
    document_ids: &'a [String],
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeletedDocumentsData {
    #[serde(default)]
    deleted_document: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DeleteIndexBody<'a> {
    index_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct RetrieveBody<'a> {
    index_id: &'a str,
    query: &'a str,
    enable_reranking: bool,
    dense_similarity_top_k: u32,
    sparse_similarity_top_k: u32,
    rerank_top_n: u32,
    rerank_min_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    search_filters: Option<&'a Vec<HashMap<String, String>>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RetrieveData {
    #[serde(default)]
    nodes: Vec<RetrieveNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RetrieveNode {
    text: String,
    score: f32,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_index_omits_unset_chunking() {
        let body = CreateIndexBody {
            name: "demo",
            structure_type: "unstructured",
            source_type: "DATA_CENTER_CATEGORY",
            sink_type: "DEFAULT",
            category_ids: vec!["cat-1"],
            chunk_size: None,
            overlap_size: Some(50),
            separator: None,
        };

        let json = serde_json::to_value(&body).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("ChunkSize"));
        assert!(!obj.contains_key("Separator"));
        assert_eq!(obj["OverlapSize"], 50);
        assert_eq!(obj["CategoryIds"], serde_json::json!(["cat-1"]));
    }

    #[test]
    fn test_decode_success_envelope() {
        let text = r#"{"Success": true, "Code": "Success", "Data": {"CategoryId": "cat-9"}}"#;
        let data: AddCategoryData = decode_envelope("AddCategory", 200, text)
            .unwrap()
            .unwrap();
        assert_eq!(data.category_id, "cat-9");
    }

    #[test]
    fn test_decode_failure_flag_is_api_error() {
        let text = r#"{"Success": false, "Code": "Index.NotFound", "Message": "no such index"}"#;
        let result: GatewayResult<Option<IdData>> = decode_envelope("CreateIndex", 200, text);

        match result {
            Err(GatewayError::Api {
                operation,
                status,
                code,
                message,
            }) => {
                assert_eq!(operation, "CreateIndex");
                assert_eq!(status, 200);
                assert_eq!(code, "Index.NotFound");
                assert_eq!(message, "no such index");
            }
            other => panic!("unexpected result: {:?}", other.map(|d| d.map(|d| d.id))),
        }
    }

    #[test]
    fn test_decode_non_json_error_status() {
        let result: GatewayResult<Option<IdData>> =
            decode_envelope("CreateIndex", 503, "upstream unavailable");
        assert!(matches!(
            result,
            Err(GatewayError::Api { status: 503, .. })
        ));

        let result: GatewayResult<Option<IdData>> =
            decode_envelope("CreateIndex", 200, "not json");
        assert!(matches!(result, Err(GatewayError::InvalidResponse { .. })));
    }

    #[test]
    fn test_decode_success_without_data() {
        let result: GatewayResult<Option<IdData>> =
            decode_envelope("DeleteIndex", 200, r#"{"Success": true}"#);
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn test_job_status_wire_format() {
        let text = r#"{
            "Success": true,
            "Data": {
                "Status": "RUNNING",
                "Documents": [
                    {"DocId": "doc-1", "DocName": "a", "Status": "FINISH", "Message": ""},
                    {"DocId": "doc-2", "DocName": "b", "Status": "PARSING"}
                ]
            }
        }"#;
        let data: JobStatusData = decode_envelope("GetIndexJobStatus", 200, text)
            .unwrap()
            .unwrap();
        assert_eq!(data.status, "RUNNING");
        assert_eq!(data.documents.len(), 2);
        assert_eq!(data.documents[0].doc_id, "doc-1");
        assert_eq!(data.documents[1].status, "PARSING");
    }
}
