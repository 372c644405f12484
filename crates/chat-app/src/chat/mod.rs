/// Generation lifecycle for the active session.
pub mod engine;
pub mod error;
/// Updates the engine reports while a generation runs.
pub mod events;
pub mod export;
/// Domain entities and the engine state machine.
pub mod message;
/// Persisted sidebar list of identified sessions.
pub mod session_store;

pub use engine::{ConversationEngine, GENERATION_ERROR_MESSAGE, GenerationOptions};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use events::{Committed, EditOutcome, EngineUpdate};
pub use export::{ExportError, ExportResult, export_json, export_markdown, import_json, transcript};
pub use message::{
    DEFAULT_SESSION_TITLE, EngineState, EngineTransition, EngineTransitionRejection,
    EngineTransitionResult, Message, MessageId, Role, Session, SessionId, SessionKey,
    TITLE_CHAR_LIMIT, TentativeSessionId, title_from, unix_timestamp_seconds,
};
pub use session_store::{SessionFilter, SessionStore, SessionSummary};
