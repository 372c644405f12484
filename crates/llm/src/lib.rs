#![deny(unsafe_code)]

/// HTTP client for the non-streaming backend endpoints.
pub mod backend;
pub mod error;
/// Best-effort follow-up question suggestions.
pub mod followup;
/// Cancellable generation streams and the HTTP transport behind them.
pub mod transport;
/// Frame format of the streamed generation endpoint.
pub mod wire;

pub use backend::{
    BackendClient, DEFAULT_BASE_URL, ExportFormat, ExportPayload, HealthStatus, RemoteMessage,
    RemoteSession,
};
pub use error::{TransportError, TransportResult};
pub use followup::{
    FALLBACK_FOLLOW_UPS, FOLLOW_UP_LIMIT, FOLLOW_UP_TIMEOUT, FollowUpAdvisor, FollowUpRequest,
    FollowUpSource, fallback_follow_ups,
};
pub use transport::{
    BoxFuture, EventSink, GenerationHandle, GenerationStream, GenerationTransport, HttpTransport,
    TransportWorker, event_channel, pump_frames,
};
pub use wire::{Completion, FrameDecoder, GenerationRequest, StreamEvent, TokenUsage};
