use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use super::{Document, DocumentStatus, DocumentUpdate, ListFilter, NewDocument, Payload};
use crate::error::{Result, WorkflowError};
use crate::payload::FileUpload;

/// Storage side of the document workflow. Adapters perform the state change
/// they are asked for; transition rules live in `DocumentService`.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn create(&self, doc: &NewDocument) -> Result<Document>;

    async fn get(&self, id: &str) -> Result<Document>;

    /// Documents matching `filter`, in repository order.
    async fn list(&self, filter: &ListFilter) -> Result<Vec<Document>>;

    async fn approve(&self, id: &str) -> Result<Document>;

    async fn decline(&self, id: &str, remarks: &str) -> Result<Document>;

    async fn edit(&self, id: &str, update: &DocumentUpdate) -> Result<Document>;

    async fn set_archived(&self, id: &str, archived: bool) -> Result<Document>;

    /// Raw bytes of the document's file (or its inline text).
    async fn view(&self, id: &str) -> Result<Vec<u8>>;
}

struct StoredDocument {
    doc: Document,
    bytes: Vec<u8>,
}

/// Process-local repository with the backend's semantics, for offline
/// sessions and tests.
pub struct InMemoryDocumentRepository {
    uploader: String,
    docs: Mutex<Vec<StoredDocument>>,
}

impl InMemoryDocumentRepository {
    pub fn new(uploader: impl Into<String>) -> Self {
        Self {
            uploader: uploader.into(),
            docs: Mutex::new(Vec::new()),
        }
    }

    fn docs(&self) -> MutexGuard<'_, Vec<StoredDocument>> {
        self.docs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<F>(&self, id: &str, f: F) -> Result<Document>
    where
        F: FnOnce(&mut StoredDocument),
    {
        let mut docs = self.docs();
        let stored = docs
            .iter_mut()
            .find(|s| s.doc.id == id)
            .ok_or_else(|| WorkflowError::NotFound(id.to_string()))?;
        f(stored);
        Ok(stored.doc.clone())
    }
}

fn payload_of(content: Option<&String>, file: Option<&FileUpload>) -> (Payload, Vec<u8>) {
    match (content, file) {
        (_, Some(file)) => (
            Payload::File {
                filename: file.filename.clone(),
            },
            file.bytes.clone(),
        ),
        (Some(text), None) => (
            Payload::Inline {
                content: text.clone(),
            },
            text.as_bytes().to_vec(),
        ),
        (None, None) => (
            Payload::Inline {
                content: String::new(),
            },
            Vec::new(),
        ),
    }
}

#[async_trait]
impl DocumentRepository for InMemoryDocumentRepository {
    async fn create(&self, new_doc: &NewDocument) -> Result<Document> {
        let mut docs = self.docs();
        let version = docs
            .iter()
            .filter(|s| s.doc.title_id == new_doc.title_id)
            .map(|s| s.doc.version)
            .max()
            .unwrap_or(0)
            + 1;
        let (payload, bytes) = payload_of(new_doc.content.as_ref(), new_doc.file.as_ref());
        let doc = Document {
            id: uuid::Uuid::new_v4().to_string(),
            title_id: new_doc.title_id,
            status: DocumentStatus::PendingApproval,
            archived: false,
            version,
            is_latest: false,
            payload,
            keywords: new_doc.keywords.clone(),
            remarks: None,
            uploaded_by: self.uploader.clone(),
            upload_timestamp: Utc::now(),
        };
        docs.push(StoredDocument {
            doc: doc.clone(),
            bytes,
        });
        Ok(doc)
    }

    async fn get(&self, id: &str) -> Result<Document> {
        self.docs()
            .iter()
            .find(|s| s.doc.id == id)
            .map(|s| s.doc.clone())
            .ok_or_else(|| WorkflowError::NotFound(id.to_string()))
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Document>> {
        Ok(self
            .docs()
            .iter()
            .filter(|s| filter.matches(&s.doc))
            .map(|s| s.doc.clone())
            .collect())
    }

    async fn approve(&self, id: &str) -> Result<Document> {
        let mut docs = self.docs();
        let title_id = docs
            .iter()
            .find(|s| s.doc.id == id)
            .map(|s| s.doc.title_id)
            .ok_or_else(|| WorkflowError::NotFound(id.to_string()))?;

        // Demotion and promotion happen under the same lock.
        let mut approved = None;
        for stored in docs.iter_mut().filter(|s| s.doc.title_id == title_id) {
            if stored.doc.id == id {
                stored.doc.status = DocumentStatus::Approved;
                stored.doc.remarks = None;
                stored.doc.is_latest = true;
                approved = Some(stored.doc.clone());
            } else {
                stored.doc.is_latest = false;
            }
        }
        approved.ok_or_else(|| WorkflowError::NotFound(id.to_string()))
    }

    async fn decline(&self, id: &str, remarks: &str) -> Result<Document> {
        self.update(id, |s| {
            s.doc.status = DocumentStatus::Declined;
            s.doc.remarks = Some(remarks.to_string());
        })
    }

    async fn edit(&self, id: &str, update: &DocumentUpdate) -> Result<Document> {
        self.update(id, |s| {
            let (payload, bytes) = payload_of(update.content.as_ref(), update.file.as_ref());
            s.doc.payload = payload;
            s.bytes = bytes;
            if let Some(keywords) = &update.keywords {
                s.doc.keywords = keywords.clone();
            }
            s.doc.status = DocumentStatus::PendingApproval;
            s.doc.remarks = None;
            s.doc.archived = false;
        })
    }

    async fn set_archived(&self, id: &str, archived: bool) -> Result<Document> {
        self.update(id, |s| s.doc.archived = archived)
    }

    async fn view(&self, id: &str) -> Result<Vec<u8>> {
        self.docs()
            .iter()
            .find(|s| s.doc.id == id)
            .map(|s| s.bytes.clone())
            .ok_or_else(|| WorkflowError::NotFound(id.to_string()))
    }
}
