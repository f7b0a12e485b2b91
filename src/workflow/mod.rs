pub mod repository;
pub mod service;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};
use crate::payload::FileUpload;

pub use repository::{DocumentRepository, InMemoryDocumentRepository};
pub use service::DocumentService;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentStatus {
    PendingApproval,
    Approved,
    Declined,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::PendingApproval => "pending-approval",
            DocumentStatus::Approved => "approved",
            DocumentStatus::Declined => "declined",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a document carries: typed-in text or a reference to an uploaded file.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
// File is tried first: some backends also send an empty `content` with files.
#[serde(untagged)]
pub enum Payload {
    File { filename: String },
    Inline { content: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub title_id: i64,
    pub status: DocumentStatus,
    #[serde(default)]
    pub archived: bool,
    pub version: u32,
    #[serde(default)]
    pub is_latest: bool,
    #[serde(flatten)]
    pub payload: Payload,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub remarks: Option<String>,
    pub uploaded_by: String,
    pub upload_timestamp: DateTime<Utc>,
}

impl Document {
    pub fn content(&self) -> Option<&str> {
        match &self.payload {
            Payload::Inline { content } => Some(content),
            Payload::File { .. } => None,
        }
    }

    pub fn filename(&self) -> Option<&str> {
        match &self.payload {
            Payload::File { filename } => Some(filename),
            Payload::Inline { .. } => None,
        }
    }

    /// Exact, case-sensitive tag match.
    pub fn has_keyword(&self, tag: &str) -> bool {
        self.keywords.iter().any(|k| k == tag)
    }
}

/// A new document as entered by an admin-creator (upload, scan or manual entry).
#[derive(Debug, Clone, Default)]
pub struct NewDocument {
    pub title_id: i64,
    pub content: Option<String>,
    pub file: Option<FileUpload>,
    pub keywords: Vec<String>,
}

impl NewDocument {
    pub fn manual(title_id: i64, content: impl Into<String>) -> Self {
        Self {
            title_id,
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn upload(title_id: i64, file: FileUpload) -> Self {
        Self {
            title_id,
            file: Some(file),
            ..Default::default()
        }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.title_id <= 0 {
            return Err(WorkflowError::validation("a type of information is required"));
        }
        validate_payload(self.content.as_deref(), self.file.as_ref())
    }
}

/// Replacement payload for a declined document being sent back for review.
#[derive(Debug, Clone, Default)]
pub struct DocumentUpdate {
    pub content: Option<String>,
    pub file: Option<FileUpload>,
    pub keywords: Option<Vec<String>>,
}

impl DocumentUpdate {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn file(file: FileUpload) -> Self {
        Self {
            file: Some(file),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_payload(self.content.as_deref(), self.file.as_ref())
    }
}

fn validate_payload(content: Option<&str>, file: Option<&FileUpload>) -> Result<()> {
    match (content, file) {
        (Some(_), Some(_)) => Err(WorkflowError::validation(
            "provide either inline content or a file, not both",
        )),
        (None, None) => Err(WorkflowError::validation("content or a file is required")),
        (Some(text), None) if text.trim().is_empty() => {
            Err(WorkflowError::validation("content must not be empty"))
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub status: Option<DocumentStatus>,
    pub title_id: Option<i64>,
    pub archived: Option<bool>,
}

impl ListFilter {
    pub fn status(status: DocumentStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn title(title_id: i64) -> Self {
        Self {
            title_id: Some(title_id),
            ..Default::default()
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.status.map_or(true, |s| doc.status == s)
            && self.title_id.map_or(true, |t| doc.title_id == t)
            && self.archived.map_or(true, |a| doc.archived == a)
    }

    pub(crate) fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(status) = self.status {
            pairs.push(("status", status.as_str().to_string()));
        }
        if let Some(title_id) = self.title_id {
            pairs.push(("titleId", title_id.to_string()));
        }
        if let Some(archived) = self.archived {
            pairs.push(("archived", archived.to_string()));
        }
        pairs
    }
}

/// Group documents by family for display, keeping the order in which each
/// title first appears.
pub fn group_by_title(docs: &[Document]) -> Vec<(i64, Vec<Document>)> {
    let mut groups: Vec<(i64, Vec<Document>)> = Vec::new();
    for doc in docs {
        match groups.iter_mut().find(|(title_id, _)| *title_id == doc.title_id) {
            Some((_, members)) => members.push(doc.clone()),
            None => groups.push((doc.title_id, vec![doc.clone()])),
        }
    }
    groups
}
