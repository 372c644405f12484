use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use snafu::{ResultExt, ensure};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{BuildClientSnafu, EmptyArgumentSnafu, TransportError, TransportResult};
use crate::wire::{FrameDecoder, GenerationRequest, StreamEvent};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type TransportWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Consumer end of one generation.
///
/// Events arrive in the order the worker read them. Once the token is
/// cancelled `recv` yields `None` without draining what is still queued, and
/// dropping the stream cancels the worker.
pub struct GenerationStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel: CancellationToken,
}

impl GenerationStream {
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.events.try_recv().ok()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Producer end handed to a transport worker.
pub struct EventSink {
    events: mpsc::UnboundedSender<StreamEvent>,
    cancel: CancellationToken,
}

impl EventSink {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Forwards one event. Returns `false` when the worker must stop, either
    /// because the caller cancelled or because the consumer is gone.
    pub fn emit(&self, event: StreamEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.events.send(event).is_ok()
    }

    fn emit_error(&self, error: TransportError) {
        let _ = self.emit(StreamEvent::Error(error.to_string()));
    }
}

pub struct GenerationHandle {
    pub stream: GenerationStream,
    pub worker: TransportWorker,
}

pub fn event_channel() -> (EventSink, GenerationStream) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    (
        EventSink {
            events: event_tx,
            cancel: cancel.clone(),
        },
        GenerationStream {
            events: event_rx,
            cancel,
        },
    )
}

pub trait GenerationTransport: Send + Sync {
    /// Opens a new generation. Nothing touches the network until the returned
    /// worker is polled.
    fn open(&self, request: GenerationRequest) -> TransportResult<GenerationHandle>;
}

/// Reads a response body chunk by chunk and forwards decoded events.
///
/// The token is checked before every read and before every emitted event, so a
/// cancelled sequence ends silently. A read error or a terminal frame ends the
/// sequence; bytes of an unterminated trailing frame are dropped.
pub async fn pump_frames<S, E>(body: S, sink: &EventSink)
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = FrameDecoder::new();

    loop {
        if sink.is_cancelled() {
            tracing::debug!("generation stream cancelled before read");
            return;
        }

        let next_chunk = tokio::select! {
            biased;
            _ = sink.cancelled() => {
                tracing::debug!("generation stream cancelled while reading");
                return;
            }
            next_chunk = body.next() => next_chunk,
        };

        match next_chunk {
            Some(Ok(chunk)) => {
                for event in decoder.push(&chunk) {
                    if !sink.emit(event) {
                        return;
                    }
                }

                if decoder.is_closed() {
                    return;
                }
            }
            Some(Err(error)) => {
                tracing::warn!(error = %error, "generation body read failed");
                let _ = sink.emit(StreamEvent::Error(format!("stream read failed: {error}")));
                return;
            }
            None => {
                if decoder.pending_len() > 0 {
                    tracing::debug!(
                        pending_bytes = decoder.pending_len(),
                        "discarding unterminated trailing frame"
                    );
                }
                return;
            }
        }
    }
}

/// Streams generations from `POST {base_url}/chat`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context(BuildClientSnafu {
                stage: "http-transport-build-client",
            })?;
        Self::with_client(client, base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> TransportResult<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        ensure!(
            !base_url.is_empty(),
            EmptyArgumentSnafu {
                stage: "http-transport-new",
                what: "base url",
            }
        );

        Ok(Self {
            client,
            endpoint: format!("{base_url}/chat"),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn run_generation_worker(
        client: reqwest::Client,
        endpoint: String,
        request: GenerationRequest,
        sink: EventSink,
    ) {
        let has_session = request.session_id.is_some();
        let send = client.post(&endpoint).json(&request).send();

        let response = tokio::select! {
            biased;
            _ = sink.cancelled() => {
                tracing::debug!(endpoint = %endpoint, "generation cancelled before response");
                return;
            }
            response = send => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(source) => {
                tracing::error!(
                    endpoint = %endpoint,
                    has_session,
                    error = %source,
                    "failed to open generation stream"
                );
                sink.emit_error(TransportError::Request {
                    stage: "generation-send",
                    source,
                });
                return;
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                endpoint = %endpoint,
                status = status.as_u16(),
                "generation request rejected"
            );
            sink.emit_error(TransportError::Status {
                stage: "generation-status",
                status: status.as_u16(),
                body,
            });
            return;
        }

        pump_frames(response.bytes_stream(), &sink).await;
    }
}

impl GenerationTransport for HttpTransport {
    fn open(&self, request: GenerationRequest) -> TransportResult<GenerationHandle> {
        ensure!(
            !request.message.trim().is_empty(),
            EmptyArgumentSnafu {
                stage: "http-transport-open",
                what: "message",
            }
        );

        let (sink, stream) = event_channel();
        let worker: TransportWorker = Box::pin(Self::run_generation_worker(
            self.client.clone(),
            self.endpoint.clone(),
            request,
            sink,
        ));

        Ok(GenerationHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use futures::stream;

    use super::*;

    fn body(chunks: &[&'static str]) -> impl Stream<Item = Result<Bytes, io::Error>> {
        stream::iter(
            chunks
                .iter()
                .map(|chunk| Ok::<_, io::Error>(Bytes::from(chunk.to_string())))
                .collect::<Vec<_>>(),
        )
    }

    fn drain(stream: &mut GenerationStream) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn pump_forwards_deltas_then_completion() {
        let (sink, mut stream) = event_channel();
        pump_frames(
            body(&[
                "data: {\"content\":\"Hel\"}\n",
                "data: {\"content\":\"lo\"}\n",
                "data: {\"done\":true,\"session_id\":\"S1\"}\n",
            ]),
            &sink,
        )
        .await;

        let events = drain(&mut stream);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], StreamEvent::ContentDelta("Hel".to_string()));
        assert_eq!(events[1], StreamEvent::ContentDelta("lo".to_string()));
        assert!(matches!(&events[2], StreamEvent::Completion(done) if done.session_id == "S1"));
    }

    #[tokio::test]
    async fn pump_stops_reading_after_error_frame() {
        let (sink, mut stream) = event_channel();
        pump_frames(
            body(&[
                "data: {\"error\":\"boom\"}\n",
                "data: {\"content\":\"never\"}\n",
            ]),
            &sink,
        )
        .await;

        assert_eq!(
            drain(&mut stream),
            vec![StreamEvent::Error("boom".to_string())]
        );
    }

    #[tokio::test]
    async fn cancelled_pump_ends_silently() {
        let (sink, mut stream) = event_channel();
        let token = stream.cancel_token();
        token.cancel();

        pump_frames(body(&["data: {\"content\":\"Hel\"}\n"]), &sink).await;

        assert!(stream.try_recv().is_none());
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn read_failure_surfaces_one_error() {
        let (sink, mut stream) = event_channel();
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"data: {\"content\":\"a\"}\n")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"data: {\"content\":\"b\"}\n")),
        ];
        pump_frames(stream::iter(chunks), &sink).await;

        let events = drain(&mut stream);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::ContentDelta("a".to_string()));
        assert!(matches!(&events[1], StreamEvent::Error(message) if message.contains("reset")));
    }

    #[tokio::test]
    async fn dropping_stream_cancels_the_sink() {
        let (sink, stream) = event_channel();
        assert!(!sink.is_cancelled());
        drop(stream);
        assert!(sink.is_cancelled());
        assert!(!sink.emit(StreamEvent::ContentDelta("x".to_string())));
    }

    #[test]
    fn endpoint_is_joined_without_double_slash() {
        let transport = HttpTransport::new("http://localhost:5000/api/").unwrap();
        assert_eq!(transport.endpoint(), "http://localhost:5000/api/chat");
        assert!(HttpTransport::new("  ").is_err());
    }

    #[test]
    fn open_rejects_blank_message() {
        let transport = HttpTransport::new("http://localhost:5000/api").unwrap();
        let result = transport.open(GenerationRequest::new("   ", None));
        assert!(matches!(result, Err(TransportError::EmptyArgument { .. })));
    }
}
