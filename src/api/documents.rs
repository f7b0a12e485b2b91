use async_trait::async_trait;
use reqwest::multipart::Form;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use super::{check, ApiConfig};
use crate::error::Result;
use crate::payload::FileUpload;
use crate::workflow::{Document, DocumentRepository, DocumentUpdate, ListFilter, NewDocument};

#[derive(Serialize)]
struct DeclineBody<'a> {
    remarks: &'a str,
}

/// `DocumentRepository` backed by the CORA REST API.
pub struct HttpDocumentRepository {
    config: ApiConfig,
    client: Client,
}

fn payload_form(
    mut form: Form,
    content: Option<&String>,
    file: Option<&FileUpload>,
    keywords: Option<&Vec<String>>,
) -> Result<Form> {
    if let Some(keywords) = keywords {
        form = form.text("keywords", serde_json::to_string(keywords)?);
    }
    if let Some(content) = content {
        form = form.text("content", content.clone());
    }
    if let Some(file) = file {
        form = form.part("file", file.to_part()?);
    }
    Ok(form)
}

impl HttpDocumentRepository {
    pub fn new(config: ApiConfig) -> Result<Self> {
        let client = config.request_client()?;
        Ok(Self { config, client })
    }

    async fn post_action(&self, id: &str, action: &str) -> Result<Document> {
        let url = self.config.url(&format!("/documents/{}/{}", id, action));
        debug!(%url, "POST");
        let resp = check(self.client.post(&url).send().await?).await?;
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl DocumentRepository for HttpDocumentRepository {
    async fn create(&self, doc: &NewDocument) -> Result<Document> {
        let form = Form::new().text("titleId", doc.title_id.to_string());
        let form = payload_form(form, doc.content.as_ref(), doc.file.as_ref(), Some(&doc.keywords))?;

        let url = self.config.url("/documents");
        debug!(%url, title_id = doc.title_id, "POST");
        let resp = check(self.client.post(&url).multipart(form).send().await?).await?;
        Ok(resp.json().await?)
    }

    async fn get(&self, id: &str) -> Result<Document> {
        let url = self.config.url(&format!("/documents/{}", id));
        debug!(%url, "GET");
        let resp = check(self.client.get(&url).send().await?).await?;
        Ok(resp.json().await?)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Document>> {
        let url = self.config.url("/documents");
        debug!(%url, ?filter, "GET");
        let resp = check(
            self.client
                .get(&url)
                .query(&filter.query_pairs())
                .send()
                .await?,
        )
        .await?;
        Ok(resp.json().await?)
    }

    async fn approve(&self, id: &str) -> Result<Document> {
        self.post_action(id, "approve").await
    }

    async fn decline(&self, id: &str, remarks: &str) -> Result<Document> {
        let url = self.config.url(&format!("/documents/{}/decline", id));
        debug!(%url, "POST");
        let resp = check(
            self.client
                .post(&url)
                .json(&DeclineBody { remarks })
                .send()
                .await?,
        )
        .await?;
        Ok(resp.json().await?)
    }

    async fn edit(&self, id: &str, update: &DocumentUpdate) -> Result<Document> {
        let form = payload_form(
            Form::new(),
            update.content.as_ref(),
            update.file.as_ref(),
            update.keywords.as_ref(),
        )?;

        let url = self.config.url(&format!("/documents/{}/edit", id));
        debug!(%url, "POST");
        let resp = check(self.client.post(&url).multipart(form).send().await?).await?;
        Ok(resp.json().await?)
    }

    async fn set_archived(&self, id: &str, archived: bool) -> Result<Document> {
        self.post_action(id, if archived { "archive" } else { "unarchive" })
            .await
    }

    async fn view(&self, id: &str) -> Result<Vec<u8>> {
        let url = self.config.url(&format!("/documents/{}/view", id));
        debug!(%url, "GET");
        let resp = check(self.client.get(&url).send().await?).await?;
        Ok(resp.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkflowError;
    use crate::workflow::DocumentStatus;
    use serde_json::json;
    use wiremock::matchers::{body_json, body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn document(id: &str, status: &str) -> serde_json::Value {
        json!({
            "id": id,
            "titleId": 5,
            "status": status,
            "archived": false,
            "version": 1,
            "isLatest": false,
            "content": "Tuition is $500",
            "filename": null,
            "keywords": ["fees"],
            "remarks": null,
            "uploadedBy": "registrar",
            "uploadTimestamp": "2024-05-01T08:00:00Z"
        })
    }

    fn repo(server: &MockServer) -> HttpDocumentRepository {
        HttpDocumentRepository::new(ApiConfig {
            base_url: server.uri(),
            token: Some("secret-token".into()),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_sends_multipart_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/documents"))
            .and(header("authorization", "Bearer secret-token"))
            .and(body_string_contains("Tuition is $500"))
            .and(body_string_contains(r#"["fees"]"#))
            .respond_with(ResponseTemplate::new(201).set_body_json(document("d1", "pending-approval")))
            .expect(1)
            .mount(&server)
            .await;

        let doc = repo(&server)
            .create(&NewDocument::manual(5, "Tuition is $500").with_keywords(["fees"]))
            .await
            .unwrap();
        assert_eq!(doc.id, "d1");
        assert_eq!(doc.status, DocumentStatus::PendingApproval);
    }

    #[tokio::test]
    async fn test_list_passes_filter_as_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/documents"))
            .and(query_param("status", "approved"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([document("d2", "approved")])))
            .mount(&server)
            .await;

        let docs = repo(&server)
            .list(&ListFilter::status(DocumentStatus::Approved))
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].status, DocumentStatus::Approved);
    }

    #[tokio::test]
    async fn test_decline_posts_remarks() {
        let server = MockServer::start().await;
        let mut declined = document("d3", "declined");
        declined["remarks"] = json!("wrong amount");
        Mock::given(method("POST"))
            .and(path("/documents/d3/decline"))
            .and(body_json(json!({ "remarks": "wrong amount" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(declined))
            .mount(&server)
            .await;

        let doc = repo(&server).decline("d3", "wrong amount").await.unwrap();
        assert_eq!(doc.remarks.as_deref(), Some("wrong amount"));
    }

    #[tokio::test]
    async fn test_backend_error_detail_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/documents/d4/approve"))
            .respond_with(
                ResponseTemplate::new(403).set_body_json(json!({ "message": "Approver role required" })),
            )
            .mount(&server)
            .await;

        let err = repo(&server).approve("d4").await.unwrap_err();
        match err {
            WorkflowError::Transport { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "Approver role required");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_view_returns_raw_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/documents/d5/view"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0x25, 0x50, 0x44, 0x46, 0xff]))
            .mount(&server)
            .await;

        let bytes = repo(&server).view("d5").await.unwrap();
        assert_eq!(bytes, vec![0x25, 0x50, 0x44, 0x46, 0xff]);
    }

    #[tokio::test]
    async fn test_archive_and_unarchive_routes() {
        let server = MockServer::start().await;
        let mut archived = document("d6", "approved");
        archived["archived"] = json!(true);
        Mock::given(method("POST"))
            .and(path("/documents/d6/archive"))
            .respond_with(ResponseTemplate::new(200).set_body_json(archived))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/documents/d6/unarchive"))
            .respond_with(ResponseTemplate::new(200).set_body_json(document("d6", "approved")))
            .mount(&server)
            .await;

        let repo = repo(&server);
        assert!(repo.set_archived("d6", true).await.unwrap().archived);
        assert!(!repo.set_archived("d6", false).await.unwrap().archived);
    }
}
