use std::path::Path;

use tracing::info;

use crate::api::{HttpAnswerTransport, HttpDocumentRepository};
use crate::chat::{AnswerTransport, ChatAggregator, DeviceProbe, Message, Role, SystemProbe, Transcript};
use crate::db::Database;
use crate::error::{Result, WorkflowError};
use crate::payload::FileUpload;
use crate::settings::Settings;
use crate::workflow::{DocumentRepository, DocumentService};

/// Everything one signed-in user works with, built once at start-up and
/// handed to callers by reference.
pub struct Session<R = HttpDocumentRepository, T = HttpAnswerTransport> {
    db: Database,
    conversation_id: String,
    documents: DocumentService<R>,
    chat: ChatAggregator<T>,
}

impl Session {
    /// Open the local database under `data_dir` and connect to the backend
    /// it is configured for.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let db = Database::new(data_dir)?;
        let settings = Settings::load(&db)?;
        info!(base_url = %settings.api_base_url, "opening session");

        let api = settings.api_config();
        let repo = HttpDocumentRepository::new(api.clone())?;
        let transport = HttpAnswerTransport::new(api)?;
        let probe = SystemProbe::new(settings.battery_path(), settings.location());
        Self::with_parts(db, repo, transport, probe, &settings)
    }
}

impl<R: DocumentRepository, T: AnswerTransport> Session<R, T> {
    pub fn with_parts(
        db: Database,
        repo: R,
        transport: T,
        probe: impl DeviceProbe + 'static,
        settings: &Settings,
    ) -> Result<Self> {
        let conversation = db.create_conversation("CORA chat")?;
        let chat = ChatAggregator::with_probe(transport, probe)
            .with_metadata_timeout(settings.metadata_timeout());
        Ok(Self {
            db,
            conversation_id: conversation.id,
            documents: DocumentService::new(repo),
            chat,
        })
    }

    /// Continue a stored conversation instead of the fresh one.
    pub fn resume(mut self, conversation_id: &str) -> Result<Self> {
        if self.db.get_conversation(conversation_id)?.is_none() {
            return Err(WorkflowError::NotFound(format!("conversation {}", conversation_id)));
        }
        let messages = self
            .db
            .get_messages(conversation_id)?
            .into_iter()
            .map(|record| -> Result<Message> {
                let role = Role::parse(&record.role).ok_or_else(|| {
                    WorkflowError::validation(format!("stored message has unknown role {}", record.role))
                })?;
                Ok(Message {
                    role,
                    text: record.content,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if self.conversation_id != conversation_id {
            self.db.delete_conversation(&self.conversation_id)?;
            self.conversation_id = conversation_id.to_string();
        }
        self.chat = self.chat.with_transcript(Transcript::from_messages(messages));
        Ok(self)
    }

    pub fn documents(&self) -> &DocumentService<R> {
        &self.documents
    }

    pub fn chat(&self) -> &ChatAggregator<T> {
        &self.chat
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Ask through the aggregator and keep the exchange in the local history.
    /// The assistant text stored is what the transcript ended with: the
    /// answer, the partial text, or the fallback message.
    pub async fn ask<F>(&self, query: &str, attachments: Vec<FileUpload>, on_chunk: F) -> Result<String>
    where
        F: FnMut(&str) + Send,
    {
        let result = self.chat.ask(query, attachments, on_chunk).await;
        if matches!(result, Err(WorkflowError::ConcurrentRequest)) {
            return result;
        }

        self.db.add_message(&self.conversation_id, Role::User.as_str(), query)?;
        let last = self.chat.transcript_snapshot().pop();
        if let Some(reply) = last.filter(|m| m.role == Role::Assistant && !m.text.is_empty()) {
            self.db
                .add_message(&self.conversation_id, Role::Assistant.as_str(), &reply.text)?;
        }
        result
    }
}
