//! Retrieval-augmented chat over one or more stores.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::chat::{ChatMessage, ChatStream};
use crate::error::{ServiceError, ServiceResult};
use crate::gateway::Chunk;
use crate::service::{NeedleService, RetrieveRequest};

/// Placeholder replaced by the retrieved chunk texts
pub const DOCUMENTS_PLACEHOLDER: &str = "${documents}";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a knowledge base assistant. \
Answer the user's question using the reference material below. \
If the material does not cover the question, say so instead of guessing.

Reference material:
${documents}";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryRequest {
    pub store_ids: Vec<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// System prompt template; must contain `${documents}` to see the chunks
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub top_k: Option<u32>,
    #[serde(default)]
    pub rerank_top_k: Option<u32>,
    #[serde(default)]
    pub sparse_top_k: Option<u32>,
    #[serde(default)]
    pub min_score: Option<f32>,
    #[serde(default)]
    pub filters: Option<Vec<HashMap<String, String>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub content: String,
}

/// Chat request ready to send, after retrieval
struct PreparedQuery {
    model: String,
    temperature: f32,
    messages: Vec<ChatMessage>,
}

impl NeedleService {
    pub async fn query(&self, request: &QueryRequest) -> ServiceResult<QueryResponse> {
        let prepared = self.prepare_query(request).await?;
        let content = self
            .chat
            .complete(&prepared.model, &prepared.messages, prepared.temperature)
            .await?;

        Ok(QueryResponse { content })
    }

    /// Like [`query`](Self::query) but yields completion tokens as they arrive.
    ///
    /// Retrieval and rewrite errors are returned before any token is produced.
    pub async fn stream_query(&self, request: &QueryRequest) -> ServiceResult<ChatStream> {
        let prepared = self.prepare_query(request).await?;
        let stream = self
            .chat
            .stream(&prepared.model, &prepared.messages, prepared.temperature)
            .await?;

        Ok(stream)
    }

    async fn prepare_query(&self, request: &QueryRequest) -> ServiceResult<PreparedQuery> {
        let settings = self.runtime_config.dynamic().query.clone();

        let query = if settings.rewrite_query {
            let prompt = vec![ChatMessage::user(build_rewrite_prompt(&request.messages))];
            let rewritten = self
                .chat
                .complete(&settings.model, &prompt, settings.temperature)
                .await?;
            debug!(query = %rewritten, "Rewrote conversation into retrieval query");
            rewritten
        } else {
            last_user_message(&request.messages)
                .ok_or_else(|| ServiceError::InvalidRequest {
                    message: "messages must contain a user message".to_string(),
                })?
                .to_string()
        };

        let chunks = self
            .retrieve(&RetrieveRequest {
                store_ids: request.store_ids.clone(),
                query,
                top_k: request.top_k,
                rerank_top_k: request.rerank_top_k,
                sparse_top_k: request.sparse_top_k,
                min_score: request.min_score,
                filters: request.filters.clone(),
            })
            .await;

        info!(
            stores = request.store_ids.len(),
            chunks = chunks.len(),
            "Prepared RAG query"
        );

        let template = request.system.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(ChatMessage::system(build_system_prompt(template, &chunks)));
        messages.extend(request.messages.iter().cloned());

        Ok(PreparedQuery {
            model: settings.model,
            temperature: request.temperature.unwrap_or(settings.temperature),
            messages,
        })
    }
}

fn build_system_prompt(template: &str, chunks: &[Chunk]) -> String {
    let documents = chunks
        .iter()
        .map(|chunk| chunk.text.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    template.replace(DOCUMENTS_PLACEHOLDER, &documents)
}

fn build_rewrite_prompt(history: &[ChatMessage]) -> String {
    let mut transcript = String::new();
    for message in history {
        transcript.push_str(&message.role);
        transcript.push_str(": ");
        transcript.push_str(&message.content);
        transcript.push('\n');
    }

    format!(
        "You write search queries for a knowledge base.\n\
         Summarise the chat history below into one sentence suitable for \
         searching the knowledge base. Only use what the history says.\n\n\
         Chat history:\n{}\n\
         Output only the search sentence.",
        transcript
    )
}

fn last_user_message(messages: &[ChatMessage]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|message| message.role == "user")
        .map(|message| message.content.as_str())
}
