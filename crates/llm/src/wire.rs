use serde::{Deserialize, Serialize};

/// Literal prefix that marks a significant frame.
pub const FRAME_PREFIX: &str = "data: ";

/// Request body for one streamed generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub message: String,
    pub session_id: Option<String>,
    pub temperature: f64,
    pub max_tokens: u64,
    pub response_style: String,
    pub response_length: String,
    pub search_depth: u32,
    pub stream: bool,
}

impl GenerationRequest {
    pub fn new(message: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            message: message.into(),
            session_id,
            temperature: 0.7,
            max_tokens: 2048,
            response_style: "balanced".to_string(),
            response_length: "medium".to_string(),
            search_depth: 25,
            stream: true,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_response_style(mut self, style: impl Into<String>) -> Self {
        self.response_style = style.into();
        self
    }

    pub fn with_response_length(mut self, length: impl Into<String>) -> Self {
        self.response_length = length.into();
        self
    }

    pub fn with_search_depth(mut self, depth: u32) -> Self {
        self.search_depth = depth;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input.saturating_add(self.output)
    }

    pub fn accumulate(&mut self, other: TokenUsage) {
        self.input = self.input.saturating_add(other.input);
        self.output = self.output.saturating_add(other.output);
    }
}

/// Terminal payload of a successful generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub session_id: String,
    pub tokens: Option<TokenUsage>,
    pub query_context: Option<String>,
}

/// Protocol events in network receipt order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    ContentDelta(String),
    Completion(Completion),
    Error(String),
}

impl StreamEvent {
    /// Completion and Error end the sequence; nothing is read after them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completion(_) | Self::Error(_))
    }
}

/// Raw JSON body of one `data: ` frame.
#[derive(Debug, Clone, Default, Deserialize)]
struct WireFrame {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    done: Option<bool>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    tokens: Option<TokenUsage>,
    #[serde(default)]
    query_context: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Reassembles newline-delimited frames across arbitrary read boundaries.
///
/// Bytes are buffered raw so that a multi-byte character split between two
/// reads is decoded only once its frame is complete. After the first terminal
/// event the decoder is closed and ignores further input.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    closed: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes held back because their frame has no terminator yet.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Feeds one network read and returns the events of every completed frame.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.closed {
            return events;
        }

        self.buffer.extend_from_slice(chunk);

        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line = self.buffer.drain(..=newline).collect::<Vec<_>>();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            decode_line(&line, &mut events);

            if events.last().is_some_and(StreamEvent::is_terminal) {
                self.closed = true;
                self.buffer.clear();
                break;
            }
        }

        events
    }
}

/// Decodes one complete line into zero or more events.
///
/// Lines without the `data: ` prefix are ignored. A frame carrying content and
/// a terminal marker yields the delta before the terminal event. Payloads that
/// are not valid UTF-8 JSON are malformed.
pub fn decode_line(line: &[u8], events: &mut Vec<StreamEvent>) {
    let Some(payload) = line.strip_prefix(FRAME_PREFIX.as_bytes()) else {
        return;
    };

    let frame = match serde_json::from_slice::<WireFrame>(payload) {
        Ok(frame) => frame,
        Err(error) => {
            tracing::warn!(error = %error, "stream frame failed to decode");
            events.push(StreamEvent::Error(format!("malformed stream frame: {error}")));
            return;
        }
    };

    if let Some(content) = frame.content
        && !content.is_empty()
    {
        events.push(StreamEvent::ContentDelta(content));
    }

    if let Some(message) = frame.error {
        events.push(StreamEvent::Error(message));
        return;
    }

    if frame.done == Some(true) {
        match frame.session_id {
            Some(session_id) if !session_id.trim().is_empty() => {
                events.push(StreamEvent::Completion(Completion {
                    session_id,
                    tokens: frame.tokens,
                    query_context: frame.query_context,
                }));
            }
            _ => events.push(StreamEvent::Error(
                "completion frame is missing session_id".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(session_id: &str) -> StreamEvent {
        StreamEvent::Completion(Completion {
            session_id: session_id.to_string(),
            tokens: None,
            query_context: None,
        })
    }

    #[test]
    fn frames_split_across_reads_are_reassembled_in_order() {
        let mut decoder = FrameDecoder::new();

        let first = decoder.push(b"data: {\"content\":\"Hel\"}\ndata: {\"con");
        assert_eq!(first, vec![StreamEvent::ContentDelta("Hel".to_string())]);
        assert!(decoder.pending_len() > 0);

        let second = decoder.push(b"tent\":\"lo\"}\n");
        assert_eq!(second, vec![StreamEvent::ContentDelta("lo".to_string())]);

        let third = decoder.push(b"data: {\"done\":true,\"session_id\":\"S1\"}\n");
        assert_eq!(third, vec![completion("S1")]);
        assert!(decoder.is_closed());
    }

    #[test]
    fn trailing_bytes_without_terminator_yield_nothing() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(b"data: {\"content\":\"partial\"}");
        assert!(events.is_empty());
        assert_eq!(decoder.pending_len(), 27);
    }

    #[test]
    fn lines_without_prefix_are_ignored() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(b": keep-alive\n\nevent: ping\r\ndata: {\"content\":\"x\"}\r\n");
        assert_eq!(events, vec![StreamEvent::ContentDelta("x".to_string())]);
    }

    #[test]
    fn malformed_json_closes_the_sequence() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(b"data: {not json}\ndata: {\"content\":\"late\"}\n");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error(_)));
        assert!(decoder.is_closed());
        assert!(decoder.push(b"data: {\"content\":\"later\"}\n").is_empty());
    }

    #[test]
    fn invalid_utf8_is_a_malformed_frame() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(b"data: {\"content\":\"caf\xe9\"}\ndata: {\"content\":\"late\"}\n");
        assert_eq!(events.len(), 1);
        let StreamEvent::Error(message) = &events[0] else {
            panic!("expected an error, got {:?}", events[0]);
        };
        assert!(message.starts_with("malformed stream frame"));
        assert!(decoder.is_closed());
    }

    #[test]
    fn error_frame_terminates_after_its_delta() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(b"data: {\"content\":\"a\",\"error\":\"boom\"}\n");
        assert_eq!(
            events,
            vec![
                StreamEvent::ContentDelta("a".to_string()),
                StreamEvent::Error("boom".to_string()),
            ]
        );
    }

    #[test]
    fn completion_carries_usage_and_context() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.push(
            b"data: {\"done\":true,\"session_id\":\"S9\",\"tokens\":{\"input\":12,\"output\":30},\"query_context\":\"education\"}\n",
        );
        assert_eq!(
            events,
            vec![StreamEvent::Completion(Completion {
                session_id: "S9".to_string(),
                tokens: Some(TokenUsage {
                    input: 12,
                    output: 30
                }),
                query_context: Some("education".to_string()),
            })]
        );
    }

    #[test]
    fn completion_without_session_id_is_an_error() {
        let mut events = Vec::new();
        decode_line(b"data: {\"done\":true}", &mut events);
        assert!(matches!(events.as_slice(), [StreamEvent::Error(_)]));
    }

    #[test]
    fn multibyte_characters_survive_read_boundaries() {
        let frame = "data: {\"content\":\"caf\u{e9}\"}\n".as_bytes();
        let split = frame.len() - 4;
        let mut decoder = FrameDecoder::new();

        assert!(decoder.push(&frame[..split]).is_empty());
        assert_eq!(
            decoder.push(&frame[split..]),
            vec![StreamEvent::ContentDelta("caf\u{e9}".to_string())]
        );
    }

    #[test]
    fn empty_content_is_skipped() {
        let mut events = Vec::new();
        decode_line(b"data: {\"content\":\"\"}", &mut events);
        assert!(events.is_empty());
    }

    #[test]
    fn request_serializes_wire_field_names() {
        let request = GenerationRequest::new("hi", None).with_search_depth(10);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["message"], "hi");
        assert!(value["session_id"].is_null());
        assert_eq!(value["search_depth"], 10);
        assert_eq!(value["stream"], true);
    }
}
