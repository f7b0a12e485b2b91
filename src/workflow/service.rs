use indexmap::IndexMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Document, DocumentRepository, DocumentStatus, DocumentUpdate, ListFilter, NewDocument};
use crate::error::{Result, WorkflowError};

/// Enforces the approval state machine on top of a `DocumentRepository` and
/// keeps the last server view of every document it has seen.
pub struct DocumentService<R> {
    repo: R,
    // Held across every check-then-transition round trip; in approve this
    // makes demoting the previous latest and promoting the new one a
    // single critical section.
    store: Mutex<IndexMap<String, Document>>,
}

fn remember(store: &mut IndexMap<String, Document>, doc: &Document) {
    store.insert(doc.id.clone(), doc.clone());
}

/// Make sure at most one document in `family` is flagged latest. `winner`
/// names the document that must hold the flag; otherwise the highest
/// approved version keeps it.
fn reconcile_latest(family: &mut [Document], winner: Option<&str>) {
    let keep = match winner {
        Some(id) => Some(id.to_string()),
        None => family
            .iter()
            .filter(|d| d.is_latest && d.status == DocumentStatus::Approved)
            .max_by_key(|d| d.version)
            .map(|d| d.id.clone()),
    };

    for doc in family.iter_mut() {
        let should_be_latest = keep.as_deref() == Some(doc.id.as_str());
        if doc.is_latest && !should_be_latest {
            warn!(
                id = %doc.id,
                title_id = doc.title_id,
                "backend reported a second latest document, demoting locally"
            );
        }
        doc.is_latest = should_be_latest;
    }
}

impl<R: DocumentRepository> DocumentService<R> {
    pub fn new(repo: R) -> Self {
        Self {
            repo,
            store: Mutex::new(IndexMap::new()),
        }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Last known state of every document this service has handled.
    pub async fn known_documents(&self) -> Vec<Document> {
        self.store.lock().await.values().cloned().collect()
    }

    pub async fn submit(&self, new_doc: NewDocument) -> Result<Document> {
        new_doc.validate()?;
        let doc = self.repo.create(&new_doc).await?;
        info!(id = %doc.id, title_id = doc.title_id, version = doc.version, "document submitted");
        remember(&mut *self.store.lock().await, &doc);
        Ok(doc)
    }

    pub async fn get(&self, id: &str) -> Result<Document> {
        let doc = self.repo.get(id).await?;
        remember(&mut *self.store.lock().await, &doc);
        Ok(doc)
    }

    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<Document>> {
        let docs = self.repo.list(filter).await?;
        let mut store = self.store.lock().await;
        for doc in &docs {
            remember(&mut store, doc);
        }
        Ok(docs)
    }

    pub async fn approve(&self, id: &str) -> Result<Document> {
        let mut store = self.store.lock().await;

        let current = self.repo.get(id).await?;
        if current.status != DocumentStatus::PendingApproval {
            return Err(WorkflowError::invalid_state(id, current.status, "approve"));
        }

        let mut approved = self.repo.approve(id).await?;
        approved.is_latest = true;
        remember(&mut store, &approved);

        // The approval is committed; a failed re-read only leaves older
        // versions stale in the local view.
        match self.repo.list(&ListFilter::title(approved.title_id)).await {
            Ok(mut family) => {
                reconcile_latest(&mut family, Some(approved.id.as_str()));
                for doc in &family {
                    remember(&mut store, doc);
                }
            }
            Err(e) => {
                warn!(id = %approved.id, title_id = approved.title_id, error = %e, "could not refresh versions after approval");
                for doc in store.values_mut() {
                    if doc.title_id == approved.title_id && doc.id != approved.id {
                        doc.is_latest = false;
                    }
                }
            }
        }

        info!(id = %approved.id, title_id = approved.title_id, version = approved.version, "document approved");
        Ok(approved)
    }

    pub async fn decline(&self, id: &str, remarks: &str) -> Result<Document> {
        if remarks.trim().is_empty() {
            return Err(WorkflowError::validation("remarks are required to decline a document"));
        }

        let mut store = self.store.lock().await;
        let current = self.repo.get(id).await?;
        if current.status != DocumentStatus::PendingApproval {
            return Err(WorkflowError::invalid_state(id, current.status, "decline"));
        }

        let declined = self.repo.decline(id, remarks).await?;
        info!(id = %declined.id, "document declined");
        remember(&mut store, &declined);
        Ok(declined)
    }

    pub async fn archive(&self, id: &str) -> Result<Document> {
        self.set_archived(id, true, "archive").await
    }

    pub async fn unarchive(&self, id: &str) -> Result<Document> {
        self.set_archived(id, false, "unarchive").await
    }

    async fn set_archived(&self, id: &str, archived: bool, operation: &'static str) -> Result<Document> {
        let mut store = self.store.lock().await;
        let current = self.repo.get(id).await?;
        if current.status == DocumentStatus::PendingApproval {
            return Err(WorkflowError::invalid_state(id, current.status, operation));
        }

        let doc = if current.archived == archived {
            debug!(id, archived, "archive flag already set");
            current
        } else {
            let doc = self.repo.set_archived(id, archived).await?;
            info!(id = %doc.id, archived, "archive flag changed");
            doc
        };
        remember(&mut store, &doc);
        Ok(doc)
    }

    pub async fn resubmit(&self, id: &str, update: DocumentUpdate) -> Result<Document> {
        update.validate()?;

        let mut store = self.store.lock().await;
        let current = self.repo.get(id).await?;
        if current.status != DocumentStatus::Declined {
            return Err(WorkflowError::invalid_state(id, current.status, "resubmit"));
        }

        let mut doc = self.repo.edit(id, &update).await?;
        if doc.archived {
            // Pending documents are never archived.
            doc = self.repo.set_archived(id, false).await?;
        }
        info!(id = %doc.id, "document resubmitted for approval");
        remember(&mut store, &doc);
        Ok(doc)
    }

    /// Documents carrying exactly `tag`, in repository order.
    pub async fn find_by_keyword(&self, tag: &str) -> Result<Vec<Document>> {
        let docs = self.list(&ListFilter::default()).await?;
        Ok(docs.into_iter().filter(|d| d.has_keyword(tag)).collect())
    }

    /// Every document in the family, any status: the preview bundle.
    pub async fn find_related_by_title(&self, title_id: i64) -> Result<Vec<Document>> {
        let mut store = self.store.lock().await;
        let mut family = self.repo.list(&ListFilter::title(title_id)).await?;
        reconcile_latest(&mut family, None);
        for doc in &family {
            remember(&mut store, doc);
        }
        Ok(family)
    }

    pub async fn latest_for_title(&self, title_id: i64) -> Result<Option<Document>> {
        let family = self.find_related_by_title(title_id).await?;
        Ok(family.into_iter().find(|d| d.is_latest))
    }

    pub async fn view(&self, id: &str) -> Result<Vec<u8>> {
        self.repo.view(id).await
    }
}
