use serde::Serialize;

use crate::workflow::DocumentStatus;

/// Every failure surfaced by the workflow core.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Cannot {operation} document {id} while it is {status}")]
    InvalidState {
        id: String,
        status: DocumentStatus,
        operation: &'static str,
    },
    #[error("Another answer is still being generated")]
    ConcurrentRequest,
    #[error("Generation failed: {0}")]
    Generation(String),
    #[error("Request cancelled")]
    Cancelled,
    #[error("API error: {status} - {message}")]
    Transport { status: u16, message: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkflowError {
    pub(crate) fn invalid_state(id: &str, status: DocumentStatus, operation: &'static str) -> Self {
        WorkflowError::InvalidState {
            id: id.to_string(),
            status,
            operation,
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        WorkflowError::Validation(message.into())
    }
}

impl Serialize for WorkflowError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
