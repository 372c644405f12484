use std::collections::VecDeque;
use std::sync::Arc;

use kestrel_llm::{
    Completion, FollowUpAdvisor, GenerationRequest, GenerationStream, GenerationTransport,
    StreamEvent, TokenUsage,
};
use kestrel_storage::{KeyValueStore, LocalAnnotationStore, Reaction, SessionKey};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::chat::error::{
    EmptyInputSnafu, EngineError, EngineResult, InvalidStateSnafu, NothingToRegenerateSnafu,
    StorageSnafu, UnknownMessageSnafu,
};
use crate::chat::events::{Committed, EditOutcome, EngineUpdate};
use crate::chat::message::{
    DEFAULT_SESSION_TITLE, EngineState, EngineTransition, Message, MessageId, Role, Session,
    SessionId, title_from, unix_timestamp_seconds,
};
use crate::chat::session_store::{SessionFilter, SessionStore, SessionSummary};

/// Assistant text appended when a generation fails.
pub const GENERATION_ERROR_MESSAGE: &str = "Sorry, I encountered an error. Please try again.";

/// Per-request generation parameters sent with every message.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f64,
    pub max_tokens: u64,
    pub response_style: String,
    pub response_length: String,
    pub search_depth: u32,
    /// Prepended to the outgoing text; never stored in history.
    pub custom_instructions: String,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2048,
            response_style: "balanced".to_string(),
            response_length: "medium".to_string(),
            search_depth: 25,
            custom_instructions: String::new(),
        }
    }
}

impl GenerationOptions {
    fn request(&self, prompt: &str, session_id: Option<&SessionId>) -> GenerationRequest {
        let instructions = self.custom_instructions.trim();
        let message = if instructions.is_empty() {
            prompt.to_string()
        } else {
            format!("{instructions}\n\n{prompt}")
        };

        GenerationRequest::new(message, session_id.map(ToString::to_string))
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
            .with_response_style(self.response_style.clone())
            .with_response_length(self.response_length.clone())
            .with_search_depth(self.search_depth)
    }
}

/// The one generation in flight.
struct ActiveGeneration {
    stream: GenerationStream,
    worker: JoinHandle<()>,
    cancel: CancellationToken,
    /// History as it was before the operation that started this generation.
    snapshot: Vec<Message>,
    /// Uncommitted assistant reply accumulating deltas.
    partial: Message,
    prompt: String,
}

impl ActiveGeneration {
    fn stop(self) -> Vec<Message> {
        self.cancel.cancel();
        self.worker.abort();
        self.snapshot
    }
}

/// Suggestions being fetched for the reply that committed last.
struct PendingFollowUps {
    message_id: MessageId,
    task: JoinHandle<Vec<String>>,
}

/// Drives one active session through send, stream, commit and recovery.
///
/// The engine is single-owner. Operations that start a generation return as
/// soon as the request is opened; the caller then pumps [`next_update`] until
/// it yields `None`. Follow-up suggestions for a committed reply arrive
/// separately through [`next_follow_ups`].
///
/// [`next_update`]: ConversationEngine::next_update
/// [`next_follow_ups`]: ConversationEngine::next_follow_ups
pub struct ConversationEngine {
    transport: Arc<dyn GenerationTransport>,
    advisor: FollowUpAdvisor,
    annotations: LocalAnnotationStore,
    sessions: SessionStore,
    options: GenerationOptions,
    session: Session,
    state: EngineState,
    active: Option<ActiveGeneration>,
    pending: VecDeque<EngineUpdate>,
    suggestions: Option<PendingFollowUps>,
    follow_ups: Vec<String>,
    usage: TokenUsage,
}

impl ConversationEngine {
    pub fn new(
        transport: Arc<dyn GenerationTransport>,
        advisor: FollowUpAdvisor,
        store: Arc<dyn KeyValueStore>,
        options: GenerationOptions,
    ) -> EngineResult<Self> {
        let sessions = SessionStore::load(store.clone())?;
        Ok(Self {
            transport,
            advisor,
            annotations: LocalAnnotationStore::new(store),
            sessions,
            options,
            session: Session::new(),
            state: EngineState::Idle,
            active: None,
            pending: VecDeque::new(),
            suggestions: None,
            follow_ups: Vec::new(),
            usage: TokenUsage::default(),
        })
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn messages(&self) -> &[Message] {
        &self.session.messages
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn annotations(&self) -> &LocalAnnotationStore {
        &self.annotations
    }

    pub fn follow_ups(&self) -> &[String] {
        &self.follow_ups
    }

    pub fn has_pending_follow_ups(&self) -> bool {
        self.suggestions.is_some()
    }

    pub fn token_usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn options(&self) -> &GenerationOptions {
        &self.options
    }

    pub fn set_options(&mut self, options: GenerationOptions) {
        self.options = options;
    }

    /// Reply text received so far for the generation in flight.
    pub fn streaming_preview(&self) -> Option<&Message> {
        self.active.as_ref().map(|active| &active.partial)
    }

    /// Token of the generation in flight; cancelling it from elsewhere
    /// settles the engine exactly like [`cancel`](Self::cancel).
    pub fn cancel_token(&self) -> Option<CancellationToken> {
        self.active.as_ref().map(|active| active.cancel.clone())
    }

    /// Appends the user message and starts a generation for it.
    pub fn send(&mut self, text: &str) -> EngineResult<()> {
        let text = text.trim();
        ensure!(!text.is_empty(), EmptyInputSnafu { stage: "engine-send" });
        self.ensure_idle("send")?;

        let snapshot = self.session.messages.clone();
        self.session.messages.push(Message::user(text));
        if let Err(error) = self.annotations.clear_draft(&self.session.key()) {
            tracing::warn!(session = %self.session.key(), error = %error, "failed to clear draft");
        }

        self.start_generation(text.to_string(), snapshot);
        Ok(())
    }

    /// Replaces the last assistant reply with a fresh generation.
    pub fn regenerate(&mut self) -> EngineResult<()> {
        self.ensure_idle("regenerate")?;

        let last = self
            .session
            .messages
            .last()
            .context(NothingToRegenerateSnafu {
                stage: "engine-regenerate",
                details: "history is empty",
            })?;
        ensure!(
            last.role == Role::Assistant,
            NothingToRegenerateSnafu {
                stage: "engine-regenerate",
                details: "last message is not an assistant reply",
            }
        );

        let prompt = self
            .session
            .messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.content.clone())
            .context(NothingToRegenerateSnafu {
                stage: "engine-regenerate",
                details: "no user message precedes the reply",
            })?;

        let snapshot = self.session.messages.clone();
        self.session.messages.pop();
        self.start_generation(prompt, snapshot);
        Ok(())
    }

    /// Replaces a message's content and drops every message after it.
    ///
    /// Editing a user message starts a new generation from it without adding
    /// another user message.
    pub fn edit(&mut self, message_id: MessageId, content: &str) -> EngineResult<EditOutcome> {
        self.ensure_not_sending("edit")?;
        let content = content.trim();
        ensure!(!content.is_empty(), EmptyInputSnafu { stage: "engine-edit" });

        let position = self
            .session
            .position_of(message_id)
            .context(UnknownMessageSnafu {
                stage: "engine-edit",
                message_id,
            })?;

        let role = {
            let message = &mut self.session.messages[position];
            message.content = content.to_string();
            message.timestamp = unix_timestamp_seconds();
            message.role
        };
        let dropped = self.session.messages.len() - position - 1;
        self.session.messages.truncate(position + 1);
        tracing::debug!(session = %self.session.key(), dropped, "truncated history after edit");

        match role {
            Role::Assistant => Ok(EditOutcome::Updated),
            Role::User => {
                let snapshot = self.session.messages.clone();
                self.start_generation(content.to_string(), snapshot);
                Ok(EditOutcome::Resubmitted)
            }
        }
    }

    /// Removes exactly one message; later messages stay in place.
    pub fn delete(&mut self, message_id: MessageId) -> EngineResult<()> {
        self.ensure_not_sending("delete")?;
        let position = self
            .session
            .position_of(message_id)
            .context(UnknownMessageSnafu {
                stage: "engine-delete",
                message_id,
            })?;
        self.session.messages.remove(position);
        Ok(())
    }

    /// Aborts the generation in flight and restores history. No-op when idle.
    pub fn cancel(&mut self) -> bool {
        if self.active.is_none() {
            return false;
        }
        self.finish_cancel();
        true
    }

    /// Waits for the next transport event and applies it.
    ///
    /// Returns `None` once no generation is in flight.
    pub async fn next_update(&mut self) -> Option<EngineUpdate> {
        if let Some(update) = self.pending.pop_front() {
            return Some(update);
        }

        let active = self.active.as_mut()?;
        let event = active.stream.recv().await;
        let cancelled = active.cancel.is_cancelled();

        let update = match event {
            Some(StreamEvent::ContentDelta(text)) => {
                active.partial.content.push_str(&text);
                EngineUpdate::Delta(text)
            }
            Some(StreamEvent::Completion(completion)) => self.commit(completion),
            Some(StreamEvent::Error(message)) => self.fail(message),
            None if cancelled => self.finish_cancel(),
            None => self.fail("stream ended before a terminal event".to_string()),
        };
        Some(update)
    }

    /// Waits for the suggestions of the last committed reply.
    ///
    /// Returns `None` when nothing is being fetched. Dropping the future
    /// before it resolves leaves the fetch running.
    pub async fn next_follow_ups(&mut self) -> Option<EngineUpdate> {
        let pending = self.suggestions.as_mut()?;
        let outcome = (&mut pending.task).await;
        let message_id = pending.message_id;
        self.suggestions = None;

        match outcome {
            Ok(suggestions) => {
                self.follow_ups = suggestions.clone();
                Some(EngineUpdate::FollowUps {
                    message_id,
                    suggestions,
                })
            }
            Err(error) => {
                tracing::warn!(reply = %message_id, error = %error, "follow-up task did not finish");
                None
            }
        }
    }

    pub fn draft(&self) -> EngineResult<String> {
        self.annotations
            .draft(&self.session.key())
            .context(StorageSnafu {
                stage: "engine-draft-read",
            })
    }

    pub fn set_draft(&self, text: &str) -> EngineResult<()> {
        self.annotations
            .set_draft(&self.session.key(), text)
            .context(StorageSnafu {
                stage: "engine-draft-write",
            })
    }

    pub fn toggle_pin(&self, message_id: MessageId) -> EngineResult<bool> {
        self.ensure_message(message_id, "engine-toggle-pin")?;
        self.annotations
            .toggle_pin(&self.session.key(), message_id)
            .context(StorageSnafu {
                stage: "engine-toggle-pin",
            })
    }

    pub fn toggle_fold(&self, message_id: MessageId) -> EngineResult<bool> {
        self.ensure_message(message_id, "engine-toggle-fold")?;
        self.annotations
            .toggle_fold(&self.session.key(), message_id)
            .context(StorageSnafu {
                stage: "engine-toggle-fold",
            })
    }

    pub fn set_reaction(
        &self,
        message_id: MessageId,
        reaction: Option<Reaction>,
    ) -> EngineResult<()> {
        self.ensure_message(message_id, "engine-set-reaction")?;
        self.annotations
            .set_reaction(&self.session.key(), message_id, reaction)
            .context(StorageSnafu {
                stage: "engine-set-reaction",
            })
    }

    pub fn toggle_favorite(&self) -> EngineResult<bool> {
        self.annotations
            .toggle_favorite(&self.session.key())
            .context(StorageSnafu {
                stage: "engine-toggle-favorite",
            })
    }

    pub fn toggle_archived(&self) -> EngineResult<bool> {
        self.annotations
            .toggle_archived(&self.session.key())
            .context(StorageSnafu {
                stage: "engine-toggle-archived",
            })
    }

    /// Abandons the active session and starts an empty one.
    pub fn new_session(&mut self) {
        self.replace_session(Session::new());
    }

    /// Makes `session` the active one, e.g. after loading it from the backend.
    pub fn open_session(&mut self, session: Session) -> EngineResult<()> {
        if let Some(id) = session.id.as_ref()
            && self.sessions.get(id).is_none()
        {
            self.sessions.upsert(SessionSummary::new(
                id.clone(),
                session.display_title().to_string(),
            ))?;
        }
        self.replace_session(session);
        Ok(())
    }

    /// Renames a listed session; the active session's title follows.
    pub fn rename_session(&mut self, id: &SessionId, title: &str) -> EngineResult<()> {
        self.sessions.rename(id, title)?;
        if self.session.id.as_ref() == Some(id) {
            self.session.title = title.trim().to_string();
        }
        Ok(())
    }

    /// Forgets a session and its annotations. Deleting the active session
    /// resets the engine to an empty one.
    pub fn delete_session(&mut self, id: &SessionId) -> EngineResult<bool> {
        let removed = self.sessions.remove(id)?;
        self.annotations
            .purge_session(&SessionKey::Assigned(id.clone()))
            .context(StorageSnafu {
                stage: "engine-delete-session",
            })?;

        if self.session.id.as_ref() == Some(id) {
            self.cancel();
            self.session = Session::new();
            self.discard_follow_ups();
        }

        tracing::info!(session = %id, removed, "deleted session");
        Ok(removed)
    }

    /// Merges the backend's session list into the local one.
    pub fn reconcile_sessions(&mut self, remote: Vec<SessionSummary>) -> EngineResult<()> {
        self.sessions.reconcile(remote)
    }

    pub fn filtered_sessions(&self, filter: &SessionFilter) -> EngineResult<Vec<SessionSummary>> {
        self.sessions.filtered(filter, &self.annotations)
    }

    /// Deletes every archived session and returns their ids.
    pub fn delete_archived_sessions(&mut self) -> EngineResult<Vec<SessionId>> {
        let archived = self.annotations.archived().context(StorageSnafu {
            stage: "engine-delete-archived",
        })?;
        let targets = self
            .sessions
            .summaries()
            .iter()
            .filter(|summary| archived.contains(&summary.key()))
            .map(|summary| summary.id.clone())
            .collect::<Vec<_>>();

        for id in &targets {
            self.delete_session(id)?;
        }
        Ok(targets)
    }

    fn replace_session(&mut self, session: Session) {
        self.cancel();
        if self.session.id.is_none()
            && let Err(error) = self.annotations.discard(self.session.tentative)
        {
            tracing::warn!(session = %self.session.key(), error = %error, "failed to discard tentative annotations");
        }
        self.session = session;
        self.discard_follow_ups();
    }

    fn discard_follow_ups(&mut self) {
        if let Some(pending) = self.suggestions.take() {
            pending.task.abort();
        }
        self.follow_ups.clear();
    }

    fn start_generation(&mut self, prompt: String, snapshot: Vec<Message>) {
        self.discard_follow_ups();
        self.transition(EngineTransition::Start);

        let request = self.options.request(&prompt, self.session.id.as_ref());
        match self.transport.open(request) {
            Ok(handle) => {
                let cancel = handle.stream.cancel_token();
                let worker = tokio::spawn(handle.worker);
                tracing::debug!(session = %self.session.key(), "generation started");
                self.active = Some(ActiveGeneration {
                    stream: handle.stream,
                    worker,
                    cancel,
                    snapshot,
                    partial: Message::assistant_streaming(),
                    prompt,
                });
            }
            Err(error) => {
                let update = self.fail(error.to_string());
                self.pending.push_back(update);
            }
        }
    }

    fn commit(&mut self, completion: Completion) -> EngineUpdate {
        self.transition(EngineTransition::Complete);
        let Some(active) = self.active.take() else {
            return EngineUpdate::Cancelled;
        };

        self.adopt_identity(&completion.session_id);

        let mut reply = active.partial;
        reply.committed = true;
        reply.timestamp = unix_timestamp_seconds();
        let message_id = reply.id;
        let reply_text = reply.content.clone();
        self.session.messages.push(reply);

        if (self.session.title.trim().is_empty() || self.session.title == DEFAULT_SESSION_TITLE)
            && let Some(first) = self.session.first_user_message()
        {
            self.session.title = title_from(&first.content);
        }

        if let Some(id) = self.session.id.clone() {
            let summary = SessionSummary::new(id, self.session.display_title().to_string());
            if let Err(error) = self.sessions.upsert(summary) {
                tracing::warn!(session = %self.session.key(), error = %error, "failed to persist session summary");
            }
        }

        if let Some(tokens) = completion.tokens {
            self.usage.accumulate(tokens);
        }

        let advisor = self.advisor.clone();
        let prompt = active.prompt;
        let context = completion.query_context;
        let task = tokio::spawn(async move {
            advisor
                .suggest(&prompt, &reply_text, context.as_deref())
                .await
        });
        self.suggestions = Some(PendingFollowUps { message_id, task });

        self.transition(EngineTransition::Settle);
        tracing::info!(
            session = %self.session.key(),
            messages = self.session.messages.len(),
            "generation committed"
        );

        EngineUpdate::Committed(Committed {
            session_id: self.session.id.clone(),
            message_id,
            tokens: completion.tokens,
        })
    }

    /// Fixes the session id on the first completion and moves tentative
    /// annotations over to it.
    fn adopt_identity(&mut self, assigned: &str) {
        match &self.session.id {
            Some(existing) if existing.as_str() != assigned => {
                tracing::warn!(
                    session = %existing,
                    reported = assigned,
                    "backend reported a different session id; keeping the original"
                );
            }
            Some(_) => {}
            None => match SessionId::new(assigned) {
                Ok(id) => {
                    if let Err(error) = self.annotations.adopt_identity(self.session.tentative, &id)
                    {
                        tracing::warn!(session = %id, error = %error, "failed to migrate tentative annotations");
                    }
                    tracing::info!(session = %id, "session identity assigned");
                    self.session.id = Some(id);
                }
                Err(error) => {
                    tracing::warn!(reported = assigned, error = %error, "ignoring unusable session id");
                }
            },
        }
    }

    fn fail(&mut self, message: String) -> EngineUpdate {
        tracing::warn!(session = %self.session.key(), error = %message, "generation failed");
        self.transition(EngineTransition::Fail {
            message: message.clone(),
        });
        if let Some(active) = self.active.take() {
            active.stop();
        }

        self.session
            .messages
            .push(Message::assistant(GENERATION_ERROR_MESSAGE));
        self.transition(EngineTransition::Settle);
        EngineUpdate::Failed { error: message }
    }

    fn finish_cancel(&mut self) -> EngineUpdate {
        if let Some(active) = self.active.take() {
            self.session.messages = active.stop();
        }
        self.transition(EngineTransition::Cancel);
        tracing::info!(session = %self.session.key(), "generation cancelled");
        EngineUpdate::Cancelled
    }

    fn transition(&mut self, transition: EngineTransition) {
        match self.state.apply(transition) {
            Ok(next) => self.state = next,
            Err(rejection) => {
                tracing::warn!(state = ?self.state, rejection = ?rejection, "ignored engine transition");
            }
        }
    }

    fn ensure_idle(&self, operation: &'static str) -> EngineResult<()> {
        ensure!(
            self.state.is_idle(),
            InvalidStateSnafu {
                stage: "engine-ensure-idle",
                operation,
                state: self.state.clone(),
            }
        );
        Ok(())
    }

    fn ensure_not_sending(&self, operation: &'static str) -> EngineResult<()> {
        ensure!(
            !self.state.is_sending(),
            InvalidStateSnafu {
                stage: "engine-ensure-not-sending",
                operation,
                state: self.state.clone(),
            }
        );
        Ok(())
    }

    fn ensure_message(&self, message_id: MessageId, stage: &'static str) -> EngineResult<()> {
        match self.session.position_of(message_id) {
            Some(_) => Ok(()),
            None => Err(EngineError::UnknownMessage { stage, message_id }),
        }
    }
}

impl Drop for ConversationEngine {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.stop();
        }
        if let Some(pending) = self.suggestions.take() {
            pending.task.abort();
        }
    }
}
