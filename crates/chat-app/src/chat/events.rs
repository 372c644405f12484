use kestrel_llm::TokenUsage;

use crate::chat::message::{MessageId, SessionId};

/// Result of applying one transport event to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineUpdate {
    /// Text appended to the streaming reply, in receipt order.
    Delta(String),
    Committed(Committed),
    /// The generation failed; one synthetic assistant message was appended.
    Failed { error: String },
    /// The generation was cancelled and history restored.
    Cancelled,
    /// Suggestions for the reply `message_id`, reported after it committed.
    FollowUps {
        message_id: MessageId,
        suggestions: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub session_id: Option<SessionId>,
    pub message_id: MessageId,
    pub tokens: Option<TokenUsage>,
}

impl EngineUpdate {
    /// Whether this update ends the generation it belongs to.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Committed(_) | Self::Failed { .. } | Self::Cancelled
        )
    }
}

/// What `edit` did after replacing the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// Assistant message edited; nothing else happens.
    Updated,
    /// User message edited and a new generation was started from it.
    Resubmitted,
}
