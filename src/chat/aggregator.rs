use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::metadata::{self, DeviceProbe, SystemProbe, DEFAULT_PROBE_TIMEOUT};
use super::transport::{AnswerTransport, GenerateRequest};
use super::{Message, Transcript};
use crate::error::{Result, WorkflowError};
use crate::payload::FileUpload;

/// Shown in place of an answer when generation fails before any text arrived.
pub const FALLBACK_ANSWER: &str = "Sorry, I couldn't generate an answer right now. Please try again.";

/// Drives one question/answer exchange at a time, folding streamed chunks
/// into the transcript.
pub struct ChatAggregator<T> {
    transport: T,
    probe: Box<dyn DeviceProbe>,
    metadata_timeout: Duration,
    transcript: Mutex<Transcript>,
    in_flight: AtomicBool,
    cancel: Mutex<Option<watch::Sender<bool>>>,
}

/// Held for the lifetime of an `ask`. Dropping it (normally, on error, or
/// because the caller dropped the future) closes the open assistant
/// message and frees the slot for the next question.
struct Flight<'a, T> {
    owner: &'a ChatAggregator<T>,
}

impl<T> Drop for Flight<'_, T> {
    fn drop(&mut self) {
        self.owner.transcript().close();
        self.owner.cancel_slot().take();
        self.owner.in_flight.store(false, Ordering::Release);
    }
}

impl<T: AnswerTransport> ChatAggregator<T> {
    pub fn new(transport: T) -> Self {
        Self::with_probe(transport, SystemProbe::default())
    }

    pub fn with_probe(transport: T, probe: impl DeviceProbe + 'static) -> Self {
        Self {
            transport,
            probe: Box::new(probe),
            metadata_timeout: DEFAULT_PROBE_TIMEOUT,
            transcript: Mutex::new(Transcript::new()),
            in_flight: AtomicBool::new(false),
            cancel: Mutex::new(None),
        }
    }

    pub fn with_metadata_timeout(mut self, timeout: Duration) -> Self {
        self.metadata_timeout = timeout;
        self
    }

    pub fn with_transcript(self, transcript: Transcript) -> Self {
        *self.transcript() = transcript;
        self
    }

    pub fn transcript_snapshot(&self) -> Vec<Message> {
        self.transcript().messages().to_vec()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Stop applying chunks of the current answer. The pending `ask`
    /// returns `Cancelled` and keeps whatever text already arrived.
    pub fn cancel(&self) {
        if let Some(tx) = self.cancel_slot().as_ref() {
            info!("cancelling answer generation");
            tx.send_replace(true);
        }
    }

    /// Ask a question. `on_chunk` receives the full answer accumulated so
    /// far after every chunk.
    pub async fn ask<F>(&self, query: &str, attachments: Vec<FileUpload>, mut on_chunk: F) -> Result<String>
    where
        F: FnMut(&str) + Send,
    {
        let _flight = self.claim()?;
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        *self.cancel_slot() = Some(cancel_tx);

        {
            let mut transcript = self.transcript();
            transcript.push_user(query)?;
            transcript.open_assistant()?;
        }
        info!(query_len = query.len(), attachments = attachments.len(), "asking question");

        let mut received = false;
        let outcome = self
            .stream_answer(query, attachments, &mut cancel_rx, &mut received, &mut on_chunk)
            .await;

        match outcome {
            Ok(answer) => {
                info!(answer_len = answer.len(), "answer complete");
                Ok(answer)
            }
            Err(WorkflowError::Cancelled) => Err(WorkflowError::Cancelled),
            Err(err) => {
                warn!(error = %err, received, "answer generation failed");
                if !received {
                    self.transcript().replace_open(FALLBACK_ANSWER);
                }
                Err(WorkflowError::Generation(generation_detail(err)))
            }
        }
    }

    async fn stream_answer<F>(
        &self,
        query: &str,
        attachments: Vec<FileUpload>,
        cancel_rx: &mut watch::Receiver<bool>,
        received: &mut bool,
        on_chunk: &mut F,
    ) -> Result<String>
    where
        F: FnMut(&str) + Send,
    {
        let metadata = metadata::collect(&*self.probe, query, self.metadata_timeout).await;
        let request = GenerateRequest {
            query: query.to_string(),
            attachments,
            metadata,
        };

        let mut chunks = tokio::select! {
            biased;
            Ok(_) = cancel_rx.wait_for(|cancelled| *cancelled) => return Err(WorkflowError::Cancelled),
            stream = self.transport.generate(request) => stream?,
        };

        let mut answer = String::new();
        loop {
            let next = tokio::select! {
                biased;
                Ok(_) = cancel_rx.wait_for(|cancelled| *cancelled) => return Err(WorkflowError::Cancelled),
                next = chunks.next() => next,
            };

            match next {
                None => return Ok(answer),
                Some(Err(err)) => return Err(err),
                Some(Ok(chunk)) => {
                    *received = true;
                    // Release the transcript lock before calling out.
                    let accumulated = self.transcript().append(&chunk);
                    if let Some(text) = accumulated {
                        debug!(chunk_len = chunk.len(), total_len = text.len(), "chunk applied");
                        on_chunk(&text);
                        answer = text;
                    }
                }
            }
        }
    }

    fn claim(&self) -> Result<Flight<'_, T>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| WorkflowError::ConcurrentRequest)?;
        Ok(Flight { owner: self })
    }
}

impl<T> ChatAggregator<T> {
    fn transcript(&self) -> MutexGuard<'_, Transcript> {
        self.transcript.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_slot(&self) -> MutexGuard<'_, Option<watch::Sender<bool>>> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn generation_detail(err: WorkflowError) -> String {
    match err {
        WorkflowError::Transport { status, message } => format!("{status}: {message}"),
        WorkflowError::Generation(detail) => detail,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::metadata::GeoPoint;
    use crate::chat::{ChunkStream, Role};
    use async_trait::async_trait;
    use futures::channel::mpsc;
    use std::sync::Arc;

    struct FixedProbe;

    #[async_trait]
    impl DeviceProbe for FixedProbe {
        async fn local_time(&self) -> Option<String> {
            Some("2024-05-01 09:30:00".into())
        }
        async fn timezone(&self) -> Option<String> {
            Some("Asia/Manila".into())
        }
        async fn battery_percent(&self) -> Option<u8> {
            None
        }
        async fn location(&self) -> Option<GeoPoint> {
            Some(GeoPoint {
                latitude: 14.6,
                longitude: 121.0,
            })
        }
    }

    /// Hands out pre-built streams in order and records every request.
    #[derive(Default)]
    struct ScriptedTransport {
        streams: Mutex<Vec<Result<ChunkStream>>>,
        requests: Arc<Mutex<Vec<GenerateRequest>>>,
    }

    impl ScriptedTransport {
        fn push(self, stream: Result<ChunkStream>) -> Self {
            self.streams.lock().unwrap().push(stream);
            self
        }
    }

    #[async_trait]
    impl AnswerTransport for ScriptedTransport {
        async fn generate(&self, request: GenerateRequest) -> Result<ChunkStream> {
            self.requests.lock().unwrap().push(request);
            let mut streams = self.streams.lock().unwrap();
            if streams.is_empty() {
                return Err(WorkflowError::Generation("no scripted stream".into()));
            }
            streams.remove(0)
        }
    }

    fn chunks(parts: &[&str]) -> Result<ChunkStream> {
        let items: Vec<Result<String>> = parts.iter().map(|p| Ok(p.to_string())).collect();
        Ok(futures::stream::iter(items).boxed())
    }

    fn channel_stream() -> (mpsc::UnboundedSender<Result<String>>, Result<ChunkStream>) {
        let (tx, rx) = mpsc::unbounded();
        (tx, Ok(rx.boxed()))
    }

    fn aggregator(transport: ScriptedTransport) -> ChatAggregator<ScriptedTransport> {
        ChatAggregator::with_probe(transport, FixedProbe)
    }

    #[tokio::test]
    async fn test_chunks_accumulate_in_order() {
        let agg = aggregator(ScriptedTransport::default().push(chunks(&["Hel", "lo, ", "world"])));
        let mut seen = Vec::new();

        let answer = agg
            .ask("greet me", Vec::new(), |text| seen.push(text.to_string()))
            .await
            .unwrap();

        assert_eq!(seen, vec!["Hel", "Hello, ", "Hello, world"]);
        assert_eq!(answer, "Hello, world");
        let transcript = agg.transcript_snapshot();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].role, Role::User);
        assert_eq!(transcript[0].text, "greet me");
        assert_eq!(transcript[1].role, Role::Assistant);
        assert_eq!(transcript[1].text, "Hello, world");
        assert!(!agg.is_in_flight());
    }

    #[tokio::test]
    async fn test_second_ask_rejected_while_in_flight() {
        let (tx, stream) = channel_stream();
        let agg = aggregator(ScriptedTransport::default().push(stream));

        let first = agg.ask("first", Vec::new(), |_| {});
        let second = async {
            tx.unbounded_send(Ok("partial".into())).unwrap();
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;

            let before = agg.transcript_snapshot();
            let err = agg.ask("second", Vec::new(), |_| {}).await.unwrap_err();
            assert!(matches!(err, WorkflowError::ConcurrentRequest));
            assert_eq!(agg.transcript_snapshot(), before);

            tx.unbounded_send(Ok(" answer".into())).unwrap();
            tx.close_channel();
        };

        let (answer, ()) = tokio::join!(first, second);
        assert_eq!(answer.unwrap(), "partial answer");
        assert_eq!(agg.transcript_snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_before_first_chunk_uses_fallback() {
        let agg = aggregator(ScriptedTransport::default().push(Err(WorkflowError::Transport {
            status: 503,
            message: "model offline".into(),
        })));

        let err = agg.ask("hello", Vec::new(), |_| {}).await.unwrap_err();
        match err {
            WorkflowError::Generation(detail) => assert_eq!(detail, "503: model offline"),
            other => panic!("unexpected error: {other:?}"),
        }
        let transcript = agg.transcript_snapshot();
        assert_eq!(transcript[1].text, FALLBACK_ANSWER);
        assert!(!agg.is_in_flight());
    }

    #[tokio::test]
    async fn test_failure_after_chunks_keeps_partial_text() {
        let items: Vec<Result<String>> = vec![
            Ok("Enrollment opens".into()),
            Err(WorkflowError::Generation("connection reset".into())),
        ];
        let agg = aggregator(
            ScriptedTransport::default().push(Ok(futures::stream::iter(items).boxed())),
        );

        let err = agg.ask("when?", Vec::new(), |_| {}).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Generation(ref d) if d == "connection reset"));
        assert_eq!(agg.transcript_snapshot()[1].text, "Enrollment opens");
    }

    #[tokio::test]
    async fn test_cancel_stops_applying_chunks() {
        let (tx, stream) = channel_stream();
        let agg = aggregator(ScriptedTransport::default().push(stream).push(chunks(&["ok"])));

        let first = agg.ask("long question", Vec::new(), |_| {});
        let control = async {
            tx.unbounded_send(Ok("Part one".into())).unwrap();
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            agg.cancel();
            tx.unbounded_send(Ok(" never shown".into())).unwrap();
        };

        let (result, ()) = tokio::join!(first, control);
        assert!(matches!(result, Err(WorkflowError::Cancelled)));
        assert_eq!(agg.transcript_snapshot()[1].text, "Part one");
        assert!(!agg.is_in_flight());

        let answer = agg.ask("next", Vec::new(), |_| {}).await.unwrap();
        assert_eq!(answer, "ok");
        assert_eq!(agg.transcript_snapshot().len(), 4);
    }

    #[tokio::test]
    async fn test_cancel_without_flight_is_noop() {
        let agg = aggregator(ScriptedTransport::default().push(chunks(&["fine"])));
        agg.cancel();
        assert_eq!(agg.ask("q", Vec::new(), |_| {}).await.unwrap(), "fine");
    }

    #[tokio::test]
    async fn test_metadata_attached_to_request() {
        let transport = ScriptedTransport::default()
            .push(chunks(&["sunny"]))
            .push(chunks(&["june"]));
        let requests = Arc::clone(&transport.requests);
        let agg = aggregator(transport);

        agg.ask("what is the weather", Vec::new(), |_| {}).await.unwrap();
        let upload = FileUpload::new("form.pdf", vec![1]);
        agg.ask("when is enrollment", vec![upload.clone()], |_| {})
            .await
            .unwrap();

        let requests = requests.lock().unwrap();
        assert_eq!(requests[0].metadata.timezone.as_deref(), Some("Asia/Manila"));
        assert!(requests[0].metadata.location.is_some());
        assert!(requests[1].metadata.location.is_none());
        assert_eq!(requests[1].attachments, vec![upload]);
    }

    #[tokio::test]
    async fn test_dropped_ask_releases_flight() {
        let (_tx, stream) = channel_stream();
        let agg = aggregator(ScriptedTransport::default().push(stream).push(chunks(&["again"])));

        {
            let pending = agg.ask("abandoned", Vec::new(), |_| {});
            futures::pin_mut!(pending);
            assert!(futures::poll!(pending.as_mut()).is_pending());
            assert!(agg.is_in_flight());
        }

        assert!(!agg.is_in_flight());
        assert_eq!(agg.ask("retry", Vec::new(), |_| {}).await.unwrap(), "again");
    }
}
