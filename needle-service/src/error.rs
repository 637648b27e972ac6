use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("Store not found: {index_id}")]
    StoreNotFound { index_id: String },

    #[error("File not found: {doc_id}")]
    FileNotFound { doc_id: String },

    #[error("{0}")]
    Gateway(#[from] GatewayError),

    #[error("{0}")]
    Chat(#[from] ChatError),

    #[error("Database error")]
    Database(#[from] DatabaseError),

    #[error("File staging failed")]
    Staging(#[from] StagingError),

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Remote indexing service errors
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Connection failed to indexing service at {url}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Indexing service call {operation} failed (status {status}, code {code}): {message}")]
    Api {
        operation: &'static str,
        status: u16,
        code: String,
        message: String,
    },

    #[error("Invalid response from indexing service for {operation}")]
    InvalidResponse {
        operation: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Indexing service response for {operation} is missing {field}")]
    MissingField {
        operation: &'static str,
        field: &'static str,
    },
}

/// Chat completion client errors
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Connection failed to chat service at {url}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Completion failed (status {status}): {message}")]
    Completion { status: u16, message: String },

    #[error("Invalid response from chat service")]
    InvalidResponse {
        #[source]
        source: serde_json::Error,
    },
}

/// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed")]
    Connection(#[source] rusqlite::Error),

    #[error("Query failed")]
    Query(#[source] rusqlite::Error),

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed")]
    Serialization(#[source] serde_json::Error),
}

/// Local staging errors
#[derive(Error, Debug)]
pub enum StagingError {
    #[error("IO error on {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid file name: {name}")]
    InvalidFileName { name: String },
}

/// API error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::TaskNotFound { .. }
            | ServiceError::StoreNotFound { .. }
            | ServiceError::FileNotFound { .. } => StatusCode::NOT_FOUND,
            ServiceError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ServiceError::Gateway(_) | ServiceError::Chat(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ServiceError::TaskNotFound { .. } => "task_not_found",
            ServiceError::StoreNotFound { .. } => "store_not_found",
            ServiceError::FileNotFound { .. } => "file_not_found",
            ServiceError::Gateway(GatewayError::Connection { .. }) => "gateway_connection",
            ServiceError::Gateway(_) => "gateway_error",
            ServiceError::Chat(ChatError::Connection { .. }) => "chat_connection",
            ServiceError::Chat(_) => "chat_error",
            ServiceError::Database(_) => "database_error",
            ServiceError::Staging(_) => "staging_error",
            ServiceError::InvalidRequest { .. } => "invalid_request",
            ServiceError::Config { .. } => "config_error",
            ServiceError::Internal { .. } => "internal_error",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code().to_string();

        let response = ErrorResponse {
            message: format_error_chain(&self),
            code: Some(code),
        };

        (status, Json(response)).into_response()
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Render an error and all of its sources as one line, outermost first.
///
/// Used for the diagnostic `message` persisted on failed tasks, where the
/// source chain (e.g. the underlying reqwest timeout) is the useful part.
pub fn format_error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !message.ends_with(&cause_text) {
            message.push_str(": ");
            message.push_str(&cause_text);
        }
        source = cause.source();
    }
    message
}
