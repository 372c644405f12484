use std::time::Duration;

use serde::Deserialize;
use snafu::{OptionExt, ResultExt, ensure};

use crate::error::{
    BuildClientSnafu, DecodePayloadSnafu, EmptyArgumentSnafu, MissingFieldSnafu, RequestSnafu,
    TransportError, TransportResult,
};
use crate::followup::{FollowUpRequest, FollowUpSource};
use crate::transport::BoxFuture;

pub const DEFAULT_BASE_URL: &str = "http://localhost:5000/api";

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteSession {
    pub session_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub messages: Vec<RemoteMessage>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Markdown,
}

impl ExportFormat {
    pub fn as_query(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Markdown => "markdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportPayload {
    Json(RemoteSession),
    Markdown(String),
}

/// Common `{status, message, ...}` envelope returned by the backend.
#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    sessions: Option<Vec<RemoteSession>>,
    #[serde(default)]
    session: Option<RemoteSession>,
    #[serde(default)]
    questions: Option<Vec<String>>,
}

/// Non-streaming calls against the chat backend.
#[derive(Debug, Clone)]
pub struct BackendClient {
    client: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(base_url: &str) -> TransportResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context(BuildClientSnafu {
                stage: "backend-build-client",
            })?;
        Self::with_client(client, base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> TransportResult<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        ensure!(
            !base_url.is_empty(),
            EmptyArgumentSnafu {
                stage: "backend-new",
                what: "base url",
            }
        );

        Ok(Self {
            client,
            base_url: base_url.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn health(&self) -> TransportResult<HealthStatus> {
        let response = self
            .client
            .get(self.url("/health"))
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .context(RequestSnafu {
                stage: "health-send",
            })?;
        let body = read_body(response, "health").await?;
        serde_json::from_str(&body).context(DecodePayloadSnafu {
            stage: "health-decode",
        })
    }

    pub async fn list_sessions(&self) -> TransportResult<Vec<RemoteSession>> {
        let response = self
            .client
            .get(self.url("/chat/sessions"))
            .send()
            .await
            .context(RequestSnafu {
                stage: "list-sessions-send",
            })?;
        let envelope = read_envelope(response, "list-sessions").await?;
        envelope.sessions.context(MissingFieldSnafu {
            stage: "list-sessions",
            field: "sessions",
        })
    }

    pub async fn get_session(&self, session_id: &str) -> TransportResult<RemoteSession> {
        ensure_session_id(session_id, "get-session")?;
        let response = self
            .client
            .get(self.url(&format!("/chat/sessions/{session_id}")))
            .send()
            .await
            .context(RequestSnafu {
                stage: "get-session-send",
            })?;
        let envelope = read_envelope(response, "get-session").await?;
        envelope.session.context(MissingFieldSnafu {
            stage: "get-session",
            field: "session",
        })
    }

    pub async fn delete_session(&self, session_id: &str) -> TransportResult<()> {
        ensure_session_id(session_id, "delete-session")?;
        let response = self
            .client
            .delete(self.url(&format!("/chat/sessions/{session_id}")))
            .send()
            .await
            .context(RequestSnafu {
                stage: "delete-session-send",
            })?;
        read_envelope(response, "delete-session").await?;
        Ok(())
    }

    pub async fn rename_session(&self, session_id: &str, title: &str) -> TransportResult<()> {
        ensure_session_id(session_id, "rename-session")?;
        let title = title.trim();
        ensure!(
            !title.is_empty(),
            EmptyArgumentSnafu {
                stage: "rename-session",
                what: "title",
            }
        );

        let response = self
            .client
            .put(self.url(&format!("/chat/sessions/{session_id}/rename")))
            .json(&serde_json::json!({ "title": title }))
            .send()
            .await
            .context(RequestSnafu {
                stage: "rename-session-send",
            })?;
        read_envelope(response, "rename-session").await?;
        Ok(())
    }

    pub async fn search_sessions(&self, query: &str) -> TransportResult<Vec<RemoteSession>> {
        let query = query.trim();
        ensure!(
            !query.is_empty(),
            EmptyArgumentSnafu {
                stage: "search-sessions",
                what: "query",
            }
        );

        let response = self
            .client
            .get(self.url("/chat/search"))
            .query(&[("q", query)])
            .send()
            .await
            .context(RequestSnafu {
                stage: "search-sessions-send",
            })?;
        let envelope = read_envelope(response, "search-sessions").await?;
        Ok(envelope.sessions.unwrap_or_default())
    }

    pub async fn export_session(
        &self,
        session_id: &str,
        format: ExportFormat,
    ) -> TransportResult<ExportPayload> {
        ensure_session_id(session_id, "export-session")?;
        let response = self
            .client
            .get(self.url(&format!("/chat/export/{session_id}")))
            .query(&[("format", format.as_query())])
            .send()
            .await
            .context(RequestSnafu {
                stage: "export-session-send",
            })?;

        match format {
            ExportFormat::Markdown => {
                let body = read_body(response, "export-session-markdown").await?;
                Ok(ExportPayload::Markdown(body))
            }
            ExportFormat::Json => {
                let envelope = read_envelope(response, "export-session-json").await?;
                let session = envelope.session.context(MissingFieldSnafu {
                    stage: "export-session-json",
                    field: "session",
                })?;
                Ok(ExportPayload::Json(session))
            }
        }
    }
}

impl FollowUpSource for BackendClient {
    fn follow_ups<'a>(
        &'a self,
        request: FollowUpRequest,
    ) -> BoxFuture<'a, TransportResult<Vec<String>>> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.url("/chat/followup"))
                .json(&request)
                .send()
                .await
                .context(RequestSnafu {
                    stage: "follow-up-send",
                })?;
            let envelope = read_envelope(response, "follow-up").await?;
            envelope.questions.context(MissingFieldSnafu {
                stage: "follow-up",
                field: "questions",
            })
        })
    }
}

fn ensure_session_id(session_id: &str, stage: &'static str) -> TransportResult<()> {
    ensure!(
        !session_id.trim().is_empty(),
        EmptyArgumentSnafu {
            stage,
            what: "session id",
        }
    );
    Ok(())
}

/// Returns the body of a successful response, or the backend's error message.
async fn read_body(response: reqwest::Response, stage: &'static str) -> TransportResult<String> {
    let status = response.status();
    let body = response.text().await.context(RequestSnafu { stage })?;

    if status.is_success() {
        return Ok(body);
    }

    let message = serde_json::from_str::<Envelope>(&body)
        .ok()
        .and_then(|envelope| envelope.message);
    match message {
        Some(message) => Err(TransportError::Backend { stage, message }),
        None => Err(TransportError::Status {
            stage,
            status: status.as_u16(),
            body,
        }),
    }
}

async fn read_envelope(response: reqwest::Response, stage: &'static str) -> TransportResult<Envelope> {
    let body = read_body(response, stage).await?;
    let envelope = serde_json::from_str::<Envelope>(&body).context(DecodePayloadSnafu { stage })?;

    if envelope.status.as_deref() == Some("error") {
        return Err(TransportError::Backend {
            stage,
            message: envelope
                .message
                .unwrap_or_else(|| "unspecified backend error".to_string()),
        });
    }

    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_tolerates_missing_fields() {
        let envelope: Envelope = serde_json::from_str("{}").unwrap();
        assert!(envelope.status.is_none());
        assert!(envelope.sessions.is_none());
    }

    #[test]
    fn remote_session_decodes_backend_shape() {
        let payload = r#"{
            "session_id": "abc",
            "title": "Education",
            "created_at": "2025-01-01T10:00:00",
            "messages": [
                {"id": "m1", "role": "user", "content": "hi", "timestamp": "2025-01-01T10:00:00", "edited": false},
                {"id": "m2", "role": "assistant", "content": "hello"}
            ],
            "metadata": {"model": "x"}
        }"#;
        let session: RemoteSession = serde_json::from_str(payload).unwrap();
        assert_eq!(session.session_id, "abc");
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].role, "assistant");
    }

    #[test]
    fn blank_base_url_is_rejected() {
        assert!(BackendClient::new("").is_err());
        let client = BackendClient::new("http://localhost:5000/api/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:5000/api");
    }
}
