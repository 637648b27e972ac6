//! HTTP API for the Needle service.
//!
//! This module provides the REST API endpoints for:
//! - Health monitoring
//! - Store creation, listing and deletion
//! - File upload, listing, deletion and content
//! - Task status polling
//! - Retrieval and RAG query (plain and SSE)
//! - Runtime settings

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    routing::{get, post},
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::service::NeedleService;

pub mod query;
pub mod settings;
pub mod stores;
pub mod tasks;
use query::{query_handler, retrieve_handler, stream_query_handler};
use settings::{get_settings_handler, update_settings_handler};
use stores::{
    add_files_handler, create_store_handler, delete_files_handler, delete_stores_handler,
    file_content_handler, list_files_handler, list_stores_handler,
};
use tasks::get_task_handler;

/// Application state
pub struct AppState {
    pub service: Arc<NeedleService>,
    pub start_time: Instant,
}

/// Transport cap on upload bodies.
///
/// The per-file size and file count limits are hot-reloadable settings and
/// are enforced per request when the files are decoded.
const MAX_UPLOAD_BODY_BYTES: usize = 1024 * 1024 * 1024;

/// Build the API router
pub fn router(service: Arc<NeedleService>) -> Router {
    let state = Arc::new(AppState {
        service,
        start_time: Instant::now(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        // Store endpoints
        .route(
            "/stores",
            get(list_stores_handler)
                .post(create_store_handler)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BODY_BYTES)),
        )
        .route("/stores/delete", post(delete_stores_handler))
        .route(
            "/stores/{index_id}/files",
            get(list_files_handler)
                .post(add_files_handler)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BODY_BYTES)),
        )
        .route("/stores/{index_id}/files/delete", post(delete_files_handler))
        .route("/files/{doc_id}/content", get(file_content_handler))
        // Task endpoints
        .route("/tasks/{task_id}", get(get_task_handler))
        // Retrieval and query
        .route("/retrieve", post(retrieve_handler))
        .route("/query", post(query_handler))
        .route("/query/stream", post(stream_query_handler))
        // Settings endpoints
        .route(
            "/settings",
            get(get_settings_handler).put(update_settings_handler),
        );

    Router::new()
        .route("/health", get(health_handler))
        .nest("/api", api_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// === Health ===

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
}
