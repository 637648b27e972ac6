use arc_swap::ArcSwap;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::db::Database;
use crate::error::{ServiceError, ServiceResult};

// ==================== Static Configuration (startup-only) ====================

/// Static configuration that cannot be changed at runtime
/// These settings affect server binding, credentials or on-disk layout
#[derive(Debug, Clone, Deserialize)]
pub struct StaticConfig {
    #[serde(default = "default_server")]
    pub server: ServerConfig,

    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub chat: ChatConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Where uploaded bytes are staged before they are sent to the indexing
    /// service. Defaults to `<data_dir>/staging`.
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
}

impl StorageConfig {
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("staging"))
    }
}

/// Remote indexing service connection
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub workspace_id: String,

    /// Category under which every store's category is created
    #[serde(default)]
    pub parent_category_id: String,

    #[serde(default)]
    pub api_key: String,

    /// Document parser requested when registering files
    #[serde(default = "default_gateway_parser")]
    pub parser: String,

    #[serde(default = "default_gateway_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: default_gateway_endpoint(),
            workspace_id: String::new(),
            parent_category_id: String::new(),
            api_key: String::new(),
            parser: default_gateway_parser(),
            timeout_secs: default_gateway_timeout_secs(),
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Chat completion service connection (OpenAI-compatible)
#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_chat_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_chat_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: default_chat_base_url(),
            api_key: String::new(),
            timeout_secs: default_chat_timeout_secs(),
        }
    }
}

// ==================== Dynamic Configuration (hot-reloadable) ====================

/// Dynamic configuration that can be updated at runtime via API
/// DB values override config file/env defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DynamicConfig {
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub stores: StoresConfig,

    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Defaults applied to retrieve requests that leave a parameter unset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: u32,

    #[serde(default = "default_rerank_top_k")]
    pub rerank_top_k: u32,

    #[serde(default = "default_sparse_top_k")]
    pub sparse_top_k: u32,

    #[serde(default = "default_min_score")]
    pub min_score: f32,

    /// Maximum simultaneous per-store retrieve calls
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            rerank_top_k: default_rerank_top_k(),
            sparse_top_k: default_sparse_top_k(),
            min_score: default_min_score(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

/// RAG query settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_chat_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Condense the conversation into a retrieval sentence before searching
    #[serde(default = "default_rewrite_query")]
    pub rewrite_query: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            model: default_chat_model(),
            temperature: default_temperature(),
            rewrite_query: default_rewrite_query(),
        }
    }
}

/// Store lifecycle policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoresConfig {
    /// When a store is deleted, also delete its file, task and file-task rows
    #[serde(default = "default_cascade_delete")]
    pub cascade_delete: bool,
}

impl Default for StoresConfig {
    fn default() -> Self {
        Self {
            cascade_delete: default_cascade_delete(),
        }
    }
}

/// Size limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,

    #[serde(default = "default_max_files_per_request")]
    pub max_files_per_request: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: default_max_file_size(),
            max_files_per_request: default_max_files_per_request(),
        }
    }
}

// ==================== DynamicConfig Settings Keys ====================

/// All valid setting keys for DynamicConfig
pub const VALID_SETTING_KEYS: &[&str] = &[
    "retrieval.top_k",
    "retrieval.rerank_top_k",
    "retrieval.sparse_top_k",
    "retrieval.min_score",
    "retrieval.max_concurrency",
    "query.model",
    "query.temperature",
    "query.rewrite_query",
    "stores.cascade_delete",
    "limits.max_file_size_bytes",
    "limits.max_files_per_request",
];

impl DynamicConfig {
    /// Get all valid setting keys
    pub fn valid_keys() -> HashSet<&'static str> {
        VALID_SETTING_KEYS.iter().copied().collect()
    }

    /// Convert config to key-value map for API response
    pub fn to_key_value_map(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();

        map.insert(
            "retrieval.top_k".to_string(),
            serde_json::json!(self.retrieval.top_k),
        );
        map.insert(
            "retrieval.rerank_top_k".to_string(),
            serde_json::json!(self.retrieval.rerank_top_k),
        );
        map.insert(
            "retrieval.sparse_top_k".to_string(),
            serde_json::json!(self.retrieval.sparse_top_k),
        );
        map.insert(
            "retrieval.min_score".to_string(),
            serde_json::json!(self.retrieval.min_score),
        );
        map.insert(
            "retrieval.max_concurrency".to_string(),
            serde_json::json!(self.retrieval.max_concurrency),
        );

        map.insert(
            "query.model".to_string(),
            serde_json::Value::String(self.query.model.clone()),
        );
        map.insert(
            "query.temperature".to_string(),
            serde_json::json!(self.query.temperature),
        );
        map.insert(
            "query.rewrite_query".to_string(),
            serde_json::json!(self.query.rewrite_query),
        );

        map.insert(
            "stores.cascade_delete".to_string(),
            serde_json::json!(self.stores.cascade_delete),
        );

        map.insert(
            "limits.max_file_size_bytes".to_string(),
            serde_json::json!(self.limits.max_file_size_bytes),
        );
        map.insert(
            "limits.max_files_per_request".to_string(),
            serde_json::json!(self.limits.max_files_per_request),
        );

        map
    }

    /// Apply DB settings as overrides to this config
    pub fn merge_from_db(&mut self, db_settings: &HashMap<String, serde_json::Value>) {
        for (key, value) in db_settings {
            self.apply_setting(key, value);
        }
    }

    /// Apply a single setting value
    fn apply_setting(&mut self, key: &str, value: &serde_json::Value) {
        match key {
            "retrieval.top_k" => {
                if let Some(v) = value.as_u64().and_then(|v| u32::try_from(v).ok()) {
                    self.retrieval.top_k = v;
                }
            }
            "retrieval.rerank_top_k" => {
                if let Some(v) = value.as_u64().and_then(|v| u32::try_from(v).ok()) {
                    self.retrieval.rerank_top_k = v;
                }
            }
            "retrieval.sparse_top_k" => {
                if let Some(v) = value.as_u64().and_then(|v| u32::try_from(v).ok()) {
                    self.retrieval.sparse_top_k = v;
                }
            }
            "retrieval.min_score" => {
                if let Some(v) = value.as_f64() {
                    self.retrieval.min_score = v as f32;
                }
            }
            "retrieval.max_concurrency" => {
                if let Some(v) = value.as_u64().and_then(|v| usize::try_from(v).ok()) {
                    // zero would stall every fan-out
                    self.retrieval.max_concurrency = v.max(1);
                }
            }

            "query.model" => {
                if let Some(v) = value.as_str() {
                    self.query.model = v.to_string();
                }
            }
            "query.temperature" => {
                if let Some(v) = value.as_f64() {
                    self.query.temperature = v as f32;
                }
            }
            "query.rewrite_query" => {
                if let Some(v) = value.as_bool() {
                    self.query.rewrite_query = v;
                }
            }

            "stores.cascade_delete" => {
                if let Some(v) = value.as_bool() {
                    self.stores.cascade_delete = v;
                }
            }

            "limits.max_file_size_bytes" => {
                if let Some(v) = value.as_u64() {
                    self.limits.max_file_size_bytes = v;
                }
            }
            "limits.max_files_per_request" => {
                if let Some(v) = value.as_u64().and_then(|v| usize::try_from(v).ok()) {
                    self.limits.max_files_per_request = v;
                }
            }

            _ => {
                tracing::warn!(key = %key, "Unknown setting key in merge_from_db");
            }
        }
    }
}

// ==================== RuntimeConfig (combines static + dynamic) ====================

/// Runtime configuration manager
/// Combines static config (startup-only) with dynamic config (hot-reloadable via ArcSwap)
pub struct RuntimeConfig {
    /// Static configuration (never changes after startup)
    pub static_config: StaticConfig,
    /// Dynamic configuration (can be hot-reloaded)
    dynamic: ArcSwap<DynamicConfig>,
}

impl RuntimeConfig {
    /// Build from already-loaded parts (used by tests and `load`)
    pub fn new(static_config: StaticConfig, dynamic: DynamicConfig) -> Self {
        Self {
            static_config,
            dynamic: ArcSwap::from_pointee(dynamic),
        }
    }

    /// Get current dynamic config snapshot (lock-free read)
    pub fn dynamic(&self) -> arc_swap::Guard<Arc<DynamicConfig>> {
        self.dynamic.load()
    }

    /// Update dynamic config (atomic swap)
    pub fn update_dynamic(&self, new_config: DynamicConfig) {
        self.dynamic.store(Arc::new(new_config));
    }

    /// Load config from all sources with DB overrides
    pub fn load(static_config: StaticConfig, db: &Database) -> ServiceResult<Self> {
        let mut dynamic = load_dynamic_config()?;
        let db_settings = db.get_all_settings()?;
        dynamic.merge_from_db(&db_settings);

        Ok(Self::new(static_config, dynamic))
    }

    /// Rebuild dynamic config from file/env defaults + DB and swap atomically
    pub fn reload_from_db(&self, db: &Database) -> ServiceResult<()> {
        let mut dynamic = load_dynamic_config()?;
        let db_settings = db.get_all_settings()?;
        dynamic.merge_from_db(&db_settings);
        self.update_dynamic(dynamic);
        Ok(())
    }
}

// ==================== Config Loading Functions ====================

fn config_sources() -> ServiceResult<Config> {
    Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(
            Environment::with_prefix("NEEDLE")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| ServiceError::Config {
            message: format!("Failed to build config: {}", e),
        })
}

/// Load static configuration from file and env vars
pub fn load_static_config() -> ServiceResult<StaticConfig> {
    config_sources()?
        .try_deserialize()
        .map_err(|e| ServiceError::Config {
            message: format!("Failed to deserialize static config: {}", e),
        })
}

/// Load dynamic configuration from file and env vars (without DB overrides)
fn load_dynamic_config() -> ServiceResult<DynamicConfig> {
    config_sources()?
        .try_deserialize()
        .map_err(|e| ServiceError::Config {
            message: format!("Failed to deserialize dynamic config: {}", e),
        })
}

// ==================== Default Value Functions ====================

fn default_server() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_storage() -> StorageConfig {
    StorageConfig {
        data_dir: default_data_dir(),
        staging_dir: None,
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_gateway_endpoint() -> String {
    "https://bailian.cn-beijing.aliyuncs.com".to_string()
}

fn default_gateway_parser() -> String {
    "DASHSCOPE_DOCMIND".to_string()
}

fn default_gateway_timeout_secs() -> u64 {
    60
}

fn default_chat_base_url() -> String {
    "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()
}

fn default_chat_timeout_secs() -> u64 {
    120
}

fn default_top_k() -> u32 {
    10
}

fn default_rerank_top_k() -> u32 {
    5
}

fn default_sparse_top_k() -> u32 {
    10
}

fn default_min_score() -> f32 {
    0.3
}

fn default_max_concurrency() -> usize {
    8
}

fn default_chat_model() -> String {
    "qwen-plus".to_string()
}

fn default_temperature() -> f32 {
    0.5
}

fn default_rewrite_query() -> bool {
    true
}

fn default_cascade_delete() -> bool {
    true
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50 MB
}

fn default_max_files_per_request() -> usize {
    100
}
