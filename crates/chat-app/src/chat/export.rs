use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat::message::{Message, MessageId, Role, Session, SessionId};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ExportError {
    #[snafu(display("failed to encode session on `{stage}`, {source}"))]
    Encode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode exported session on `{stage}`, {source}"))]
    Decode {
        stage: &'static str,
        source: serde_json::Error,
    },
}

pub type ExportResult<T> = Result<T, ExportError>;

#[derive(Debug, Serialize, Deserialize)]
struct ExportedMessage {
    id: MessageId,
    role: Role,
    content: String,
    timestamp: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExportedSession {
    session_id: Option<SessionId>,
    title: String,
    created_at: u64,
    messages: Vec<ExportedMessage>,
}

/// Pretty-printed JSON document of a session's committed history.
pub fn export_json(session: &Session) -> ExportResult<String> {
    let document = ExportedSession {
        session_id: session.id.clone(),
        title: session.display_title().to_string(),
        created_at: session.created_at,
        messages: session
            .messages
            .iter()
            .filter(|message| message.committed)
            .map(|message| ExportedMessage {
                id: message.id,
                role: message.role,
                content: message.content.clone(),
                timestamp: message.timestamp,
            })
            .collect(),
    };

    serde_json::to_string_pretty(&document).context(EncodeSnafu {
        stage: "export-json",
    })
}

/// Rebuilds a session from [`export_json`] output.
///
/// Message ids stay as exported; a repeated id gets a freshly minted one so
/// ids remain unique within the session.
pub fn import_json(text: &str) -> ExportResult<Session> {
    let document = serde_json::from_str::<ExportedSession>(text).context(DecodeSnafu {
        stage: "import-json",
    })?;

    let mut seen = BTreeSet::new();
    let messages = document
        .messages
        .into_iter()
        .map(|exported| {
            let id = if seen.insert(exported.id) {
                exported.id
            } else {
                let minted = MessageId::new_v7();
                tracing::debug!(duplicate = %exported.id, minted = %minted, "re-keyed duplicate message id on import");
                seen.insert(minted);
                minted
            };
            Message {
                id,
                role: exported.role,
                content: exported.content,
                timestamp: exported.timestamp,
                committed: true,
            }
        })
        .collect();

    Ok(Session {
        id: document.session_id,
        title: document.title,
        messages,
        created_at: document.created_at,
        ..Session::new()
    })
}

pub fn export_markdown(session: &Session) -> String {
    let mut markdown = format!(
        "# {}\n\nCreated: {}\n\n",
        session.display_title(),
        session.created_at
    );
    for message in session.messages.iter().filter(|message| message.committed) {
        markdown.push_str(&format!(
            "**{}**: {}\n\n---\n\n",
            message.role.label(),
            message.content
        ));
    }
    markdown
}

/// Plain-text transcript for copying a whole conversation.
pub fn transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|message| {
            let speaker = match message.role {
                Role::User => "You",
                Role::Assistant => "Assistant",
            };
            format!("{speaker}: {}", message.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Session {
        let mut session = Session::new();
        session.id = Some(SessionId::new("S1").unwrap());
        session.title = "Education".to_string();
        session.messages = vec![
            Message::user("Where did you study?"),
            Message::assistant("At the university\nof somewhere."),
            Message::user("Anything **else**?"),
        ];
        session
    }

    fn pairs(session: &Session) -> Vec<(Role, String)> {
        session
            .messages
            .iter()
            .map(|message| (message.role, message.content.clone()))
            .collect()
    }

    #[test]
    fn json_export_then_import_keeps_order_and_content() {
        let session = sample();
        let restored = import_json(&export_json(&session).unwrap()).unwrap();

        assert_eq!(pairs(&restored), pairs(&session));
        assert_eq!(restored.id, session.id);
        assert_eq!(restored.title, "Education");
        assert_eq!(restored.messages[0].id, session.messages[0].id);
    }

    #[test]
    fn streaming_reply_is_left_out_of_exports() {
        let mut session = sample();
        session.messages.push(Message::assistant_streaming());

        let restored = import_json(&export_json(&session).unwrap()).unwrap();
        assert_eq!(restored.messages.len(), 3);
        assert_eq!(export_markdown(&session).matches("---").count(), 3);
    }

    #[test]
    fn import_rekeys_repeated_message_ids() {
        let mut session = sample();
        let shared = session.messages[0].id;
        session.messages[2].id = shared;

        let restored = import_json(&export_json(&session).unwrap()).unwrap();

        assert_eq!(pairs(&restored), pairs(&session));
        assert_eq!(restored.messages[0].id, shared);
        assert_ne!(restored.messages[2].id, shared);
        let unique = restored
            .messages
            .iter()
            .map(|message| message.id)
            .collect::<BTreeSet<_>>();
        assert_eq!(unique.len(), restored.messages.len());
    }

    #[test]
    fn import_rejects_garbage() {
        assert!(matches!(
            import_json("{\"title\": 3}"),
            Err(ExportError::Decode { .. })
        ));
    }

    #[test]
    fn markdown_has_title_created_line_and_separated_blocks() {
        let session = sample();
        let markdown = export_markdown(&session);

        assert!(markdown.starts_with("# Education\n\nCreated: "));
        assert!(markdown.contains("**User**: Where did you study?\n\n---\n\n"));
        assert!(markdown.contains("**Assistant**: At the university\nof somewhere.\n\n---\n\n"));
    }

    #[test]
    fn untitled_session_exports_default_title() {
        let markdown = export_markdown(&Session::new());
        assert!(markdown.starts_with("# New Conversation\n"));
    }

    #[test]
    fn transcript_uses_speaker_prefixes() {
        let session = sample();
        let text = transcript(&session.messages[..2]);
        assert_eq!(
            text,
            "You: Where did you study?\n\nAssistant: At the university\nof somewhere."
        );
    }
}
