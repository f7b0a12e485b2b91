pub mod documents;
pub mod generate;

use std::time::Duration;

use reqwest::{header, Client, Response};

use crate::error::{Result, WorkflowError};

pub use documents::HttpDocumentRepository;
pub use generate::HttpAnswerTransport;

const GENERIC_ERROR: &str = "The server returned an error without details";

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    /// Bearer token issued by the session collaborator.
    pub token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            token: None,
            timeout_secs: 30,
        }
    }
}

impl ApiConfig {
    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn default_headers(&self) -> Result<header::HeaderMap> {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = self.token.as_deref().filter(|t| !t.is_empty()) {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| WorkflowError::validation("API token contains invalid characters"))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Client for request/response calls, bounded by the configured timeout.
    pub(crate) fn request_client(&self) -> Result<Client> {
        Ok(Client::builder()
            .default_headers(self.default_headers()?)
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?)
    }

    /// Client for streamed answers. Only connecting is bounded; the body may
    /// take as long as the backend needs.
    pub(crate) fn streaming_client(&self) -> Result<Client> {
        Ok(Client::builder()
            .default_headers(self.default_headers()?)
            .connect_timeout(Duration::from_secs(self.timeout_secs))
            .build()?)
    }
}

/// Pull a human-readable message out of a backend error body.
pub fn error_detail(body: &str) -> String {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["message", "detail", "error"] {
            if let Some(serde_json::Value::String(text)) = map.get(key) {
                if !text.trim().is_empty() {
                    return text.clone();
                }
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        GENERIC_ERROR.to_string()
    } else {
        trimmed.to_string()
    }
}

pub(crate) async fn check(resp: Response) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let text = resp.text().await.unwrap_or_default();
    Err(WorkflowError::Transport {
        status,
        message: error_detail(&text),
    })
}
