use std::time::{SystemTime, UNIX_EPOCH};

use kestrel_llm::RemoteSession;
use serde::{Deserialize, Serialize};

pub use kestrel_storage::{MessageId, SessionId, SessionKey, TentativeSessionId};

/// Title shown until the first user message names the session.
pub const DEFAULT_SESSION_TITLE: &str = "New Conversation";
pub const TITLE_CHAR_LIMIT: usize = 50;

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }

    pub fn from_wire(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "assistant" | "bot" => Some(Self::Assistant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp: u64,
    /// False only for the assistant reply that is still streaming.
    pub committed: bool,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new_v7(),
            role,
            content: content.into(),
            timestamp: unix_timestamp_seconds(),
            committed: true,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Empty assistant placeholder that accumulates deltas.
    pub fn assistant_streaming() -> Self {
        Self {
            committed: false,
            ..Self::new(Role::Assistant, String::new())
        }
    }
}

/// One conversation with its full history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Assigned by the backend on the first completed generation, never changed after.
    pub id: Option<SessionId>,
    pub tentative: TentativeSessionId,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: None,
            tentative: TentativeSessionId::new_v7(),
            title: String::new(),
            messages: Vec::new(),
            created_at: unix_timestamp_seconds(),
        }
    }

    /// Key for local annotations: the assigned id once known, else the tentative one.
    pub fn key(&self) -> SessionKey {
        match &self.id {
            Some(id) => SessionKey::Assigned(id.clone()),
            None => SessionKey::Tentative(self.tentative),
        }
    }

    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            DEFAULT_SESSION_TITLE
        } else {
            &self.title
        }
    }

    pub fn position_of(&self, message_id: MessageId) -> Option<usize> {
        self.messages
            .iter()
            .position(|message| message.id == message_id)
    }

    pub fn first_user_message(&self) -> Option<&Message> {
        self.messages
            .iter()
            .find(|message| message.role == Role::User)
    }

    /// Builds a session from the backend's representation.
    ///
    /// Message ids that are not UUIDs are replaced by fresh local ids, and
    /// messages with an unknown role are skipped.
    pub fn from_remote(remote: RemoteSession) -> Self {
        let id = match SessionId::new(remote.session_id.clone()) {
            Ok(id) => Some(id),
            Err(error) => {
                tracing::warn!(session = %remote.session_id, error = %error, "ignoring invalid remote session id");
                None
            }
        };

        let messages = remote
            .messages
            .into_iter()
            .filter_map(|remote_message| {
                let Some(role) = Role::from_wire(&remote_message.role) else {
                    tracing::warn!(role = %remote_message.role, "skipping remote message with unknown role");
                    return None;
                };

                let mut message = Message::new(role, remote_message.content);
                if let Some(raw_id) = remote_message.id.as_deref() {
                    match MessageId::parse(raw_id) {
                        Ok(parsed) => message.id = parsed,
                        Err(_) => {
                            tracing::debug!(raw_id, "remote message id is not a uuid; minted a local id")
                        }
                    }
                }
                Some(message)
            })
            .collect();

        Self {
            id,
            title: remote.title,
            messages,
            ..Self::new()
        }
    }
}

/// First `TITLE_CHAR_LIMIT` characters of `text`, on a single line.
pub fn title_from(text: &str) -> String {
    let single_line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    single_line.chars().take(TITLE_CHAR_LIMIT).collect()
}

pub fn unix_timestamp_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

/// Observable lifecycle of the conversation engine.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Idle,
    Sending,
    Committing,
    Error {
        message: String,
    },
}

/// State transition input for one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineTransition {
    Start,
    Complete,
    Fail { message: String },
    Cancel,
    Settle,
}

/// Rejection reason for illegal engine transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineTransitionRejection {
    Busy { state: EngineState },
    NotSending { state: EngineState },
    NothingToSettle,
}

pub type EngineTransitionResult = Result<EngineState, EngineTransitionRejection>;

impl EngineState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_sending(&self) -> bool {
        matches!(self, Self::Sending)
    }

    /// Applies one transition deterministically.
    ///
    /// `Start` is accepted only from `Idle`. `Complete`, `Fail` and `Cancel`
    /// require an active generation; `Settle` returns `Committing` and `Error`
    /// to `Idle`.
    pub fn apply(&self, transition: EngineTransition) -> EngineTransitionResult {
        match (self, transition) {
            (Self::Idle, EngineTransition::Start) => Ok(Self::Sending),
            (state, EngineTransition::Start) => Err(EngineTransitionRejection::Busy {
                state: state.clone(),
            }),
            (Self::Sending, EngineTransition::Complete) => Ok(Self::Committing),
            (Self::Sending, EngineTransition::Fail { message }) => Ok(Self::Error { message }),
            (Self::Sending, EngineTransition::Cancel) => Ok(Self::Idle),
            (
                state,
                EngineTransition::Complete | EngineTransition::Fail { .. } | EngineTransition::Cancel,
            ) => Err(EngineTransitionRejection::NotSending {
                state: state.clone(),
            }),
            (Self::Committing | Self::Error { .. }, EngineTransition::Settle) => Ok(Self::Idle),
            (Self::Idle | Self::Sending, EngineTransition::Settle) => {
                Err(EngineTransitionRejection::NothingToSettle)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use kestrel_llm::RemoteMessage;

    use super::*;

    #[test]
    fn start_is_only_accepted_from_idle() {
        let sending = EngineState::Idle.apply(EngineTransition::Start).unwrap();
        assert_eq!(sending, EngineState::Sending);
        assert!(matches!(
            sending.apply(EngineTransition::Start),
            Err(EngineTransitionRejection::Busy { .. })
        ));
    }

    #[test]
    fn terminal_transitions_require_sending() {
        assert!(EngineState::Idle.apply(EngineTransition::Cancel).is_err());
        assert!(EngineState::Idle.apply(EngineTransition::Complete).is_err());

        let failed = EngineState::Sending
            .apply(EngineTransition::Fail {
                message: "boom".to_string(),
            })
            .unwrap();
        assert_eq!(failed.apply(EngineTransition::Settle).unwrap(), EngineState::Idle);
        assert_eq!(
            EngineState::Sending
                .apply(EngineTransition::Complete)
                .and_then(|state| state.apply(EngineTransition::Settle))
                .unwrap(),
            EngineState::Idle
        );
    }

    #[test]
    fn title_is_first_fifty_characters_on_one_line() {
        let text = "Tell me about\nthe   education background and the projects you have worked on";
        let title = title_from(text);
        assert_eq!(title.chars().count(), TITLE_CHAR_LIMIT);
        assert!(title.starts_with("Tell me about the education"));
        assert_eq!(title_from("short"), "short");
    }

    #[test]
    fn session_key_follows_identity() {
        let mut session = Session::new();
        assert!(session.key().is_tentative());

        session.id = Some(SessionId::new("S1").unwrap());
        assert_eq!(session.key().to_string(), "S1");
    }

    #[test]
    fn remote_sessions_keep_uuid_ids_and_skip_unknown_roles() {
        let kept = MessageId::new_v7();
        let session = Session::from_remote(RemoteSession {
            session_id: "S1".to_string(),
            title: "Education".to_string(),
            messages: vec![
                RemoteMessage {
                    id: Some(kept.to_string()),
                    role: "user".to_string(),
                    content: "hi".to_string(),
                    timestamp: None,
                },
                RemoteMessage {
                    id: Some("legacy-2".to_string()),
                    role: "assistant".to_string(),
                    content: "hello".to_string(),
                    timestamp: None,
                },
                RemoteMessage {
                    id: None,
                    role: "system".to_string(),
                    content: "ignored".to_string(),
                    timestamp: None,
                },
            ],
            created_at: None,
            updated_at: None,
        });

        assert_eq!(session.id.as_ref().map(SessionId::as_str), Some("S1"));
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].id, kept);
        assert_ne!(session.messages[1].id, kept);
        assert!(session.messages.iter().all(|message| message.committed));
    }
}
