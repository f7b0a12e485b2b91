pub mod aggregator;
pub mod metadata;
pub mod transport;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WorkflowError};

pub use aggregator::{ChatAggregator, FALLBACK_ANSWER};
pub use metadata::{DeviceMetadata, DeviceProbe, GeoPoint, SystemProbe};
pub use transport::{AnswerTransport, ChunkStream, GenerateRequest};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(role: &str) -> Option<Self> {
        match role {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

/// Ordered chat history. At most one assistant message is open (still
/// receiving chunks) and no user message may follow it until it closes.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<Message>,
    open: Option<usize>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a closed transcript from stored messages.
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            open: None,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn push_user(&mut self, text: &str) -> Result<()> {
        if self.is_open() {
            return Err(WorkflowError::ConcurrentRequest);
        }
        self.messages.push(Message {
            role: Role::User,
            text: text.to_string(),
        });
        Ok(())
    }

    pub fn open_assistant(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(WorkflowError::ConcurrentRequest);
        }
        self.messages.push(Message {
            role: Role::Assistant,
            text: String::new(),
        });
        self.open = Some(self.messages.len() - 1);
        Ok(())
    }

    fn open_message(&mut self) -> Option<&mut Message> {
        let idx = self.open?;
        self.messages.get_mut(idx)
    }

    /// Append a chunk to the open assistant message and return the text
    /// accumulated so far.
    pub fn append(&mut self, chunk: &str) -> Option<String> {
        let message = self.open_message()?;
        message.text.push_str(chunk);
        Some(message.text.clone())
    }

    pub fn open_text(&self) -> Option<&str> {
        self.open
            .and_then(|idx| self.messages.get(idx))
            .map(|m| m.text.as_str())
    }

    pub fn replace_open(&mut self, text: &str) {
        if let Some(message) = self.open_message() {
            message.text = text.to_string();
        }
    }

    pub fn close(&mut self) -> Option<Message> {
        let idx = self.open.take()?;
        self.messages.get(idx).cloned()
    }
}
