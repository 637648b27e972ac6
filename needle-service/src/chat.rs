use async_stream::stream;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::config::ChatConfig;
use crate::error::{ChatError, ServiceError, ServiceResult};

/// Completion tokens in arrival order
pub type ChatStream = BoxStream<'static, Result<String, ChatError>>;

/// OpenAI-compatible chat completion client
pub struct ChatClient {
    client: Client,
    config: ChatConfig,
}

impl ChatClient {
    pub fn new(config: ChatConfig) -> ServiceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                ServiceError::Chat(ChatError::Connection {
                    url: config.base_url.clone(),
                    source: e,
                })
            })?;

        Ok(Self { client, config })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    async fn post(&self, request: &CompletionRequest<'_>) -> Result<reqwest::Response, ChatError> {
        let url = self.completions_url();
        debug!(model = %request.model, stream = request.stream, "Requesting chat completion");

        let mut builder = self.client.post(&url).json(request);
        if !self.config.api_key.is_empty() {
            builder = builder.bearer_auth(&self.config.api_key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ChatError::Connection {
                url: url.clone(),
                source: e,
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ChatError::Completion { status, message });
        }

        Ok(response)
    }

    /// Generate a single non-streaming completion
    pub async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String, ChatError> {
        let request = CompletionRequest {
            model,
            messages,
            temperature,
            stream: false,
        };

        let response = self.post(&request).await?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| ChatError::Connection {
            url: self.completions_url(),
            source: e,
        })?;

        let completion: CompletionResponse =
            serde_json::from_str(&text).map_err(|source| ChatError::InvalidResponse { source })?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or(ChatError::Completion {
                status,
                message: "completion returned no choices".to_string(),
            })
    }

    /// Stream completion tokens as they arrive.
    ///
    /// The stream ends at the `[DONE]` sentinel or when the connection
    /// closes. Dropping it closes the connection.
    pub async fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<ChatStream, ChatError> {
        let request = CompletionRequest {
            model,
            messages,
            temperature,
            stream: true,
        };

        let response = self.post(&request).await?;
        let url = self.completions_url();
        let mut bytes = response.bytes_stream();

        Ok(stream! {
            let mut buffer: Vec<u8> = Vec::new();

            'read: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(ChatError::Connection {
                            url: url.clone(),
                            source: e,
                        });
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);

                // Lines may be split across chunks; only parse complete ones
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    match parse_sse_line(&String::from_utf8_lossy(&line)) {
                        Ok(SseLine::Delta(text)) => yield Ok(text),
                        Ok(SseLine::Done) => break 'read,
                        Ok(SseLine::Skip) => {}
                        Err(e) => {
                            yield Err(e);
                            break 'read;
                        }
                    }
                }
            }
        }
        .boxed())
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine, ChatError> {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();

    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let chunk: StreamChunk =
        serde_json::from_str(data).map_err(|source| ChatError::InvalidResponse { source })?;

    // usage-only chunks have no choices
    let content = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .unwrap_or_default();

    if content.is_empty() {
        Ok(SseLine::Skip)
    } else {
        Ok(SseLine::Delta(content))
    }
}

/// Chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

// Internal API types

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
