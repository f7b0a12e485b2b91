use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart::Form;
use reqwest::Client;
use tracing::debug;

use super::{check, ApiConfig};
use crate::chat::{AnswerTransport, ChunkStream, GenerateRequest};
use crate::error::{Result, WorkflowError};

/// Streams answers from `POST /generate`.
pub struct HttpAnswerTransport {
    config: ApiConfig,
    client: Client,
}

impl HttpAnswerTransport {
    pub fn new(config: ApiConfig) -> Result<Self> {
        let client = config.streaming_client()?;
        Ok(Self { config, client })
    }
}

/// Incremental UTF-8 decoding. Bytes of a character split across network
/// frames are held back until the rest arrives.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            let (valid, invalid) = match std::str::from_utf8(&self.pending) {
                Ok(_) => (self.pending.len(), None),
                Err(e) => (e.valid_up_to(), Some(e.error_len())),
            };
            out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
            match invalid {
                None => {
                    self.pending.clear();
                    return out;
                }
                // Incomplete sequence at the end: wait for more bytes.
                Some(None) => {
                    self.pending.drain(..valid);
                    return out;
                }
                Some(Some(len)) => {
                    out.push(char::REPLACEMENT_CHARACTER);
                    self.pending.drain(..valid + len);
                }
            }
        }
    }

    /// Whatever is left once the body ends.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

#[async_trait]
impl AnswerTransport for HttpAnswerTransport {
    async fn generate(&self, request: GenerateRequest) -> Result<ChunkStream> {
        let mut form = Form::new().text("query", request.query);
        for (name, value) in request.metadata.form_fields() {
            form = form.text(name, value);
        }
        for attachment in &request.attachments {
            form = form.part("attachments", attachment.to_part()?);
        }

        let url = self.config.url("/generate");
        debug!(%url, attachments = request.attachments.len(), "POST");
        let resp = check(self.client.post(&url).multipart(form).send().await?).await?;

        let body = resp.bytes_stream().boxed();
        let chunks = futures::stream::unfold(
            (body, Utf8Decoder::default(), false),
            |(mut body, mut decoder, done)| async move {
                if done {
                    return None;
                }
                loop {
                    match body.next().await {
                        Some(Ok(bytes)) => {
                            let text = decoder.push(&bytes);
                            if !text.is_empty() {
                                return Some((Ok(text), (body, decoder, false)));
                            }
                        }
                        Some(Err(e)) => {
                            return Some((Err(WorkflowError::from(e)), (body, decoder, true)));
                        }
                        None => {
                            let rest = decoder.finish();
                            if rest.is_empty() {
                                return None;
                            }
                            return Some((Ok(rest), (body, decoder, true)));
                        }
                    }
                }
            },
        );
        Ok(chunks.boxed())
    }
}
