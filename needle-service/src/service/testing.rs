//! In-memory gateway and service builder for workflow tests.

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::post,
};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use super::NeedleService;
use crate::chat::ChatClient;
use crate::config::{ChatConfig, DynamicConfig, RuntimeConfig, StaticConfig};
use crate::db::Database;
use crate::error::GatewayError;
use crate::gateway::{
    Chunk, CreateIndexRequest, DocumentStatus, GatewayResult, IndexingGateway, JobStatus,
    RemoteFile, RetrieveParams, UploadLease, UploadLeaseRequest,
};
use crate::staging::FileStaging;

fn rejected(operation: &'static str) -> GatewayError {
    GatewayError::Api {
        operation,
        status: 200,
        code: "Fake.Rejected".to_string(),
        message: format!("{} rejected", operation),
    }
}

/// Gateway double. Every call succeeds unless configured to fail.
pub struct FakeGateway {
    pub fail_add_category: bool,
    pub fail_create_index: bool,
    pub fail_submit: bool,
    /// File names whose upload lease is refused
    pub fail_lease_for: HashSet<String>,
    /// File names whose byte upload errors
    pub fail_put_for: HashSet<String>,
    /// File names the remote refuses to register
    pub fail_register_for: HashSet<String>,
    /// Index ids whose retrieve call errors
    pub failing_stores: HashSet<String>,
    /// Chunks returned per index id
    pub chunks: HashMap<String, Vec<Chunk>>,
    /// Raw job status reported by `get_job_status`
    pub job_status: Mutex<String>,
    /// Raw status reported for every document in the job
    pub document_status: Mutex<String>,
    pub fail_job_status: Mutex<bool>,
    /// Runs once at the start of the next `get_job_status` call
    pub before_job_status: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    /// Simulated latency of each retrieve call
    pub retrieve_delay: Duration,

    pub create_index_requests: Mutex<Vec<CreateIndexRequest>>,
    pub submitted_jobs: Mutex<Vec<(String, Vec<String>)>>,
    pub retrieved_stores: Mutex<Vec<String>>,
    pub deleted_stores: Mutex<Vec<String>>,
    pub job_status_calls: AtomicUsize,
    /// Highest number of retrieve calls seen running at once
    pub max_retrieve_in_flight: AtomicUsize,

    pub(crate) retrieve_in_flight: AtomicUsize,
    pub(crate) next_id: AtomicUsize,
    pub(crate) lease_names: Mutex<HashMap<String, String>>,
    pub(crate) doc_names: Mutex<HashMap<String, String>>,
    pub(crate) jobs: Mutex<HashMap<String, Vec<String>>>,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self {
            fail_add_category: false,
            fail_create_index: false,
            fail_submit: false,
            fail_lease_for: HashSet::new(),
            fail_put_for: HashSet::new(),
            fail_register_for: HashSet::new(),
            failing_stores: HashSet::new(),
            chunks: HashMap::new(),
            job_status: Mutex::new("COMPLETED".to_string()),
            document_status: Mutex::new("FINISH".to_string()),
            fail_job_status: Mutex::new(false),
            before_job_status: Mutex::new(None),
            retrieve_delay: Duration::from_millis(10),
            create_index_requests: Mutex::new(Vec::new()),
            submitted_jobs: Mutex::new(Vec::new()),
            retrieved_stores: Mutex::new(Vec::new()),
            deleted_stores: Mutex::new(Vec::new()),
            job_status_calls: AtomicUsize::new(0),
            max_retrieve_in_flight: AtomicUsize::new(0),
            retrieve_in_flight: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
            lease_names: Mutex::new(HashMap::new()),
            doc_names: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

impl FakeGateway {
    fn next(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn leased_name(&self, lease_id: &str) -> String {
        self.lease_names
            .lock()
            .unwrap()
            .get(lease_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_job_state(&self, job: &str, document: &str) {
        *self.job_status.lock().unwrap() = job.to_string();
        *self.document_status.lock().unwrap() = document.to_string();
    }
}

#[async_trait]
impl IndexingGateway for FakeGateway {
    async fn add_category(&self, _name: &str) -> GatewayResult<String> {
        if self.fail_add_category {
            return Err(rejected("AddCategory"));
        }
        Ok(self.next("cat"))
    }

    async fn create_index(&self, request: &CreateIndexRequest) -> GatewayResult<String> {
        self.create_index_requests
            .lock()
            .unwrap()
            .push(request.clone());
        if self.fail_create_index {
            return Err(rejected("CreateIndex"));
        }
        Ok(self.next("idx"))
    }

    async fn apply_upload_lease(
        &self,
        _category_id: &str,
        request: &UploadLeaseRequest,
    ) -> GatewayResult<UploadLease> {
        if self.fail_lease_for.contains(&request.file_name) {
            return Err(rejected("ApplyFileUploadLease"));
        }
        let lease_id = self.next("lease");
        self.lease_names
            .lock()
            .unwrap()
            .insert(lease_id.clone(), request.file_name.clone());
        Ok(UploadLease {
            url: format!("https://upload.invalid/{}", lease_id),
            lease_id,
            headers: HashMap::new(),
        })
    }

    async fn put_bytes(
        &self,
        url: &str,
        _headers: &HashMap<String, String>,
        _content: Vec<u8>,
    ) -> GatewayResult<()> {
        let lease_id = url.rsplit('/').next().unwrap_or_default();
        if self.fail_put_for.contains(&self.leased_name(lease_id)) {
            return Err(GatewayError::Api {
                operation: "PutBytes",
                status: 403,
                code: String::new(),
                message: "upload refused".to_string(),
            });
        }
        Ok(())
    }

    async fn register_file(&self, _category_id: &str, lease_id: &str) -> GatewayResult<String> {
        let name = self.leased_name(lease_id);
        if self.fail_register_for.contains(&name) {
            return Err(rejected("AddFile"));
        }
        let doc_id = self.next("doc");
        self.doc_names.lock().unwrap().insert(doc_id.clone(), name);
        Ok(doc_id)
    }

    async fn submit_index_job(
        &self,
        index_id: &str,
        document_ids: &[String],
    ) -> GatewayResult<String> {
        if self.fail_submit {
            return Err(rejected("SubmitIndexJob"));
        }
        self.submitted_jobs
            .lock()
            .unwrap()
            .push((index_id.to_string(), document_ids.to_vec()));
        let job_id = self.next("job");
        self.jobs
            .lock()
            .unwrap()
            .insert(job_id.clone(), document_ids.to_vec());
        Ok(job_id)
    }

    async fn get_job_status(&self, _index_id: &str, job_id: &str) -> GatewayResult<JobStatus> {
        self.job_status_calls.fetch_add(1, Ordering::SeqCst);
        let hook = self.before_job_status.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        if *self.fail_job_status.lock().unwrap() {
            return Err(rejected("GetIndexJobStatus"));
        }

        let document_status = self.document_status.lock().unwrap().clone();
        let doc_ids = self
            .jobs
            .lock()
            .unwrap()
            .get(job_id)
            .cloned()
            .unwrap_or_default();
        let doc_names = self.doc_names.lock().unwrap();
        let documents: Vec<DocumentStatus> = doc_ids
            .into_iter()
            .map(|doc_id| DocumentStatus {
                doc_name: doc_names.get(&doc_id).cloned().unwrap_or_default(),
                doc_id,
                status: document_status.clone(),
                message: None,
            })
            .collect();

        Ok(JobStatus {
            status: self.job_status.lock().unwrap().clone(),
            message: None,
            documents,
        })
    }

    async fn list_files(&self, _category_id: &str) -> GatewayResult<Vec<RemoteFile>> {
        let doc_names = self.doc_names.lock().unwrap();
        Ok(doc_names
            .iter()
            .map(|(doc_id, doc_name)| RemoteFile {
                doc_id: doc_id.clone(),
                doc_name: doc_name.clone(),
                status: "PARSE_SUCCESS".to_string(),
            })
            .collect())
    }

    async fn delete_files(
        &self,
        _index_id: &str,
        doc_ids: &[String],
    ) -> GatewayResult<Vec<String>> {
        let mut doc_names = self.doc_names.lock().unwrap();
        Ok(doc_ids
            .iter()
            .filter(|id| doc_names.remove(*id).is_some())
            .cloned()
            .collect())
    }

    async fn delete_store(&self, index_id: &str) -> GatewayResult<()> {
        self.deleted_stores
            .lock()
            .unwrap()
            .push(index_id.to_string());
        Ok(())
    }

    async fn retrieve(&self, index_id: &str, _params: &RetrieveParams) -> GatewayResult<Vec<Chunk>> {
        self.retrieved_stores
            .lock()
            .unwrap()
            .push(index_id.to_string());

        let in_flight = self.retrieve_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_retrieve_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);
        tokio::time::sleep(self.retrieve_delay).await;
        self.retrieve_in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_stores.contains(index_id) {
            return Err(rejected("Retrieve"));
        }
        Ok(self.chunks.get(index_id).cloned().unwrap_or_default())
    }
}

pub fn chunk(text: &str, score: f32) -> Chunk {
    Chunk {
        text: text.to_string(),
        score,
        metadata: serde_json::Value::Null,
    }
}

/// Service over an in-memory database and a temporary staging directory
pub fn test_service(gateway: Arc<FakeGateway>) -> (Arc<NeedleService>, TempDir) {
    test_service_with_chat(gateway, ChatConfig::default())
}

pub fn test_service_with_chat(
    gateway: Arc<FakeGateway>,
    chat: ChatConfig,
) -> (Arc<NeedleService>, TempDir) {
    let temp = TempDir::new().unwrap();
    let static_config: StaticConfig = serde_json::from_value(json!({})).unwrap();
    let runtime_config = Arc::new(RuntimeConfig::new(static_config, DynamicConfig::default()));
    let db = Arc::new(Database::open_in_memory().unwrap());
    let staging = Arc::new(FileStaging::new(temp.path()));
    let chat = Arc::new(ChatClient::new(chat).unwrap());

    let service = NeedleService::new(runtime_config, db, gateway, staging, chat);
    (Arc::new(service), temp)
}

/// Local OpenAI-compatible chat endpoint that always answers `reply`
pub struct ChatServer {
    pub base_url: String,
    /// Request bodies in arrival order
    pub requests: Arc<Mutex<Vec<Value>>>,
}

#[derive(Clone)]
struct ChatServerState {
    reply: Arc<str>,
    requests: Arc<Mutex<Vec<Value>>>,
}

async fn completions(State(state): State<ChatServerState>, Json(body): Json<Value>) -> Response {
    let stream = body["stream"].as_bool().unwrap_or(false);
    state.requests.lock().unwrap().push(body);

    if !stream {
        return Json(json!({
            "choices": [{ "message": { "role": "assistant", "content": &*state.reply } }]
        }))
        .into_response();
    }

    let mut events = String::new();
    for (i, word) in state.reply.split(' ').enumerate() {
        let token = if i == 0 {
            word.to_string()
        } else {
            format!(" {}", word)
        };
        let chunk = json!({ "choices": [{ "delta": { "content": token } }] });
        events.push_str(&format!("data: {}\n\n", chunk));
    }
    events.push_str("data: [DONE]\n\n");

    ([(header::CONTENT_TYPE, "text/event-stream")], events).into_response()
}

pub async fn spawn_chat_server(reply: &str) -> ChatServer {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let state = ChatServerState {
        reply: Arc::from(reply),
        requests: requests.clone(),
    };
    let app = Router::new()
        .route("/chat/completions", post(completions))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    ChatServer {
        base_url: format!("http://{}", addr),
        requests,
    }
}
