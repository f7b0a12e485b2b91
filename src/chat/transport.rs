use async_trait::async_trait;
use futures::stream::BoxStream;

use super::metadata::DeviceMetadata;
use crate::error::Result;
use crate::payload::FileUpload;

/// Text chunks in the order the transport delivered them.
pub type ChunkStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub query: String,
    pub attachments: Vec<FileUpload>,
    pub metadata: DeviceMetadata,
}

/// Answer-generation endpoint. A non-success response must surface as an
/// error from `generate`, before any chunk is yielded.
#[async_trait]
pub trait AnswerTransport: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<ChunkStream>;
}
