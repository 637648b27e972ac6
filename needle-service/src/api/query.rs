//! Retrieval and RAG query endpoints.

use axum::{
    Json,
    extract::State,
    response::{Sse, sse::Event},
};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::{ServiceError, format_error_chain};
use crate::gateway::Chunk;
use crate::service::{QueryRequest, QueryResponse, RetrieveRequest};

use super::AppState;

#[derive(Serialize)]
pub struct RetrieveResponse {
    pub chunks: Vec<Chunk>,
}

fn require_stores(store_ids: &[String]) -> Result<(), ServiceError> {
    if store_ids.is_empty() {
        return Err(ServiceError::InvalidRequest {
            message: "At least one store id is required".to_string(),
        });
    }
    Ok(())
}

pub async fn retrieve_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RetrieveRequest>,
) -> Result<Json<RetrieveResponse>, ServiceError> {
    require_stores(&request.store_ids)?;
    let chunks = state.service.retrieve(&request).await;
    Ok(Json(RetrieveResponse { chunks }))
}

pub async fn query_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ServiceError> {
    require_stores(&request.store_ids)?;
    let response = state.service.query(&request).await?;
    Ok(Json(response))
}

/// Stream completion tokens as SSE `data: {"content": ...}` events.
///
/// A failure mid-stream is sent as one `error` event before the stream ends.
pub async fn stream_query_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServiceError> {
    require_stores(&request.store_ids)?;
    let tokens = state.service.stream_query(&request).await?;

    let events = tokens.map(|token| {
        let event = match token {
            Ok(content) => Event::default().data(
                serde_json::to_string(&QueryResponse { content }).unwrap_or_default(),
            ),
            Err(e) => {
                let message = format_error_chain(&e);
                warn!(error = %message, "Query stream failed");
                Event::default().event("error").data(message)
            }
        };
        Ok::<_, Infallible>(event)
    });

    Ok(Sse::new(events).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}
