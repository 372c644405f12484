use std::path::PathBuf;
use std::sync::Arc;

use kestrel_llm::{
    BackendClient, ExportFormat, ExportPayload, FollowUpAdvisor, HttpTransport, TransportError,
};
use kestrel_storage::{JsonFileStore, KeyValueStore, Reaction, SqliteKvStore, StorageError};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdout};

use crate::chat::{
    ConversationEngine, EditOutcome, EngineError, EngineUpdate, ExportError, MessageId, Session,
    SessionFilter, SessionId, SessionSummary, export_json, export_markdown, transcript,
};
use crate::settings::{ClientSettings, StorageBackend};

pub const JSON_STORE_FILE_NAME: &str = "state.json";
pub const SQLITE_STORE_FILE_NAME: &str = "state.db";

const HELP: &str = "\
Type a message and press enter to send it. Ctrl-C stops a reply.
  /regen                 regenerate the last reply
  /edit N TEXT           replace message N and drop what follows it
  /delete N              delete message N
  /pin N                 pin or unpin message N
  /fold N                fold or unfold message N
  /react N up|down|none  react to message N
  /draft TEXT            save a draft for this session
  /history               print the conversation
  /new                   start a new conversation
  /sessions              list sessions
  /archived              switch between active and archived sessions
  /search QUERY          search sessions
  /open ID               open a session
  /rename TITLE          rename this session
  /remove ID             delete a session
  /favorite              toggle favorite on this session
  /archive               toggle archived on this session
  /purge-archived        delete every archived session
  /export json|md        export this session
  /tokens                show token usage
  /help                  show this help
  /quit                  exit
";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("{details}"))]
    InvalidCommand {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("backend call failed on `{stage}`, {source}"))]
    Backend {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("{source}"))]
    Engine {
        stage: &'static str,
        source: EngineError,
    },
    #[snafu(display("failed to open local store on `{stage}`, {source}"))]
    OpenStore {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("local storage failed on `{stage}`, {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("export failed on `{stage}`, {source}"))]
    Export {
        stage: &'static str,
        source: ExportError,
    },
    #[snafu(display("terminal io failed on `{stage}`, {source}"))]
    Terminal {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type AppResult<T> = Result<T, AppError>;

/// One line of terminal input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Regenerate,
    Edit { index: usize, text: String },
    Delete { index: usize },
    Pin { index: usize },
    Fold { index: usize },
    React { index: usize, reaction: Option<Reaction> },
    Draft(String),
    History,
    New,
    Sessions,
    ToggleArchivedView,
    Search(String),
    Open(String),
    Rename(String),
    Remove(String),
    Favorite,
    Archive,
    PurgeArchived,
    Export(ExportFormat),
    Tokens,
    Help,
    Quit,
}

/// Parses one input line. Blank lines yield `None`.
///
/// Message indexes are 1-based as printed by `/history`.
pub fn parse_command(line: &str) -> AppResult<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Send(line.to_string())));
    };

    let (name, argument) = match rest.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, argument.trim()),
        None => (rest, ""),
    };

    let command = match name {
        "regen" | "regenerate" => Command::Regenerate,
        "edit" => {
            let (index, text) = split_index(argument, "edit")?;
            ensure!(
                !text.is_empty(),
                InvalidCommandSnafu {
                    stage: "parse-edit",
                    details: "usage: /edit N TEXT",
                }
            );
            Command::Edit {
                index,
                text: text.to_string(),
            }
        }
        "delete" => Command::Delete {
            index: parse_index(argument, "delete")?,
        },
        "pin" => Command::Pin {
            index: parse_index(argument, "pin")?,
        },
        "fold" => Command::Fold {
            index: parse_index(argument, "fold")?,
        },
        "react" => {
            let (index, raw) = split_index(argument, "react")?;
            let reaction = match raw {
                "up" | "+1" => Some(Reaction::Up),
                "down" | "-1" => Some(Reaction::Down),
                "none" | "clear" => None,
                _ => {
                    return InvalidCommandSnafu {
                        stage: "parse-react",
                        details: "usage: /react N up|down|none",
                    }
                    .fail();
                }
            };
            Command::React { index, reaction }
        }
        "draft" => Command::Draft(argument.to_string()),
        "history" => Command::History,
        "new" => Command::New,
        "sessions" => Command::Sessions,
        "archived" => Command::ToggleArchivedView,
        "search" => Command::Search(required(argument, "search", "QUERY")?),
        "open" => Command::Open(required(argument, "open", "ID")?),
        "rename" => Command::Rename(required(argument, "rename", "TITLE")?),
        "remove" => Command::Remove(required(argument, "remove", "ID")?),
        "favorite" | "fav" => Command::Favorite,
        "archive" => Command::Archive,
        "purge-archived" => Command::PurgeArchived,
        "export" => match argument {
            "json" => Command::Export(ExportFormat::Json),
            "md" | "markdown" => Command::Export(ExportFormat::Markdown),
            _ => {
                return InvalidCommandSnafu {
                    stage: "parse-export",
                    details: "usage: /export json|md",
                }
                .fail();
            }
        },
        "tokens" => Command::Tokens,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => {
            return InvalidCommandSnafu {
                stage: "parse-command",
                details: format!("unknown command `/{other}`, try /help"),
            }
            .fail();
        }
    };

    Ok(Some(command))
}

fn parse_index(raw: &str, command: &str) -> AppResult<usize> {
    match raw.trim().parse::<usize>() {
        Ok(index) if index > 0 => Ok(index),
        _ => InvalidCommandSnafu {
            stage: "parse-index",
            details: format!("/{command} expects a message number from /history"),
        }
        .fail(),
    }
}

fn split_index<'a>(argument: &'a str, command: &str) -> AppResult<(usize, &'a str)> {
    let (raw, rest) = argument
        .split_once(char::is_whitespace)
        .unwrap_or((argument, ""));
    Ok((parse_index(raw, command)?, rest.trim()))
}

fn required(argument: &str, command: &str, what: &str) -> AppResult<String> {
    ensure!(
        !argument.is_empty(),
        InvalidCommandSnafu {
            stage: "parse-argument",
            details: format!("usage: /{command} {what}"),
        }
    );
    Ok(argument.to_string())
}

/// Opens the configured key-value backend under the data directory.
pub async fn open_store(settings: &ClientSettings) -> AppResult<Arc<dyn KeyValueStore>> {
    let directory = settings.data_directory();
    let store: Arc<dyn KeyValueStore> = match settings.storage {
        StorageBackend::Json => {
            let path = directory.join(JSON_STORE_FILE_NAME);
            Arc::new(JsonFileStore::open(path).context(OpenStoreSnafu {
                stage: "open-json-store",
            })?)
        }
        StorageBackend::Sqlite => {
            let path: PathBuf = directory.join(SQLITE_STORE_FILE_NAME);
            Arc::new(
                SqliteKvStore::open(&path.to_string_lossy())
                    .await
                    .context(OpenStoreSnafu {
                        stage: "open-sqlite-store",
                    })?,
            )
        }
    };

    tracing::info!(directory = ?directory, backend = ?settings.storage, "opened local store");
    Ok(store)
}

/// Line-oriented terminal front end over one [`ConversationEngine`].
pub struct App<W = Stdout> {
    engine: ConversationEngine,
    backend: BackendClient,
    filter: SessionFilter,
    listed: Vec<SessionSummary>,
    out: W,
}

impl App {
    pub async fn new(settings: &ClientSettings) -> AppResult<Self> {
        let backend = BackendClient::new(&settings.base_url).context(BackendSnafu {
            stage: "app-backend-client",
        })?;
        let transport = HttpTransport::new(&settings.base_url).context(BackendSnafu {
            stage: "app-http-transport",
        })?;
        let store = open_store(settings).await?;

        let engine = ConversationEngine::new(
            Arc::new(transport),
            FollowUpAdvisor::new(Arc::new(backend.clone())),
            store,
            settings.generation_options(),
        )
        .context(EngineSnafu {
            stage: "app-engine",
        })?;

        Ok(Self::with_parts(engine, backend, tokio::io::stdout()))
    }
}

impl<W: AsyncWrite + Unpin> App<W> {
    pub fn with_parts(engine: ConversationEngine, backend: BackendClient, out: W) -> Self {
        Self {
            engine,
            backend,
            filter: SessionFilter::default(),
            listed: Vec::new(),
            out,
        }
    }

    /// Reads commands until `/quit`, end of input, or Ctrl-C at the prompt.
    pub async fn run(&mut self) -> AppResult<()> {
        match self.backend.health().await {
            Ok(health) => tracing::info!(status = %health.status, base_url = %self.backend.base_url(), "backend reachable"),
            Err(error) => tracing::warn!(error = %error, "backend health check failed"),
        }
        self.say(HELP).await?;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            self.write("> ").await?;
            let line = loop {
                tokio::select! {
                    line = lines.next_line() => break line.context(TerminalSnafu { stage: "read-line" })?,
                    _ = tokio::signal::ctrl_c() => break None,
                    Some(update) = self.engine.next_follow_ups(), if self.engine.has_pending_follow_ups() => {
                        if let EngineUpdate::FollowUps { suggestions, .. } = update
                            && !suggestions.is_empty()
                        {
                            self.write(&format!("\n{}> ", render_follow_ups(&suggestions))).await?;
                        }
                    }
                }
            };
            let Some(line) = line else {
                break;
            };

            let outcome = match parse_command(&line) {
                Ok(None) => continue,
                Ok(Some(Command::Quit)) => break,
                Ok(Some(command)) => self.execute(command).await,
                Err(error) => Err(error),
            };
            if let Err(error) = outcome {
                tracing::debug!(error = ?error, "command failed");
                self.say(&format!("error: {error}")).await?;
            }
        }

        self.engine.cancel();
        self.say("bye").await
    }

    pub async fn execute(&mut self, command: Command) -> AppResult<()> {
        match command {
            Command::Send(text) => {
                self.engine.send(&text).context(EngineSnafu { stage: "send" })?;
                self.stream_reply().await
            }
            Command::Regenerate => {
                self.engine
                    .regenerate()
                    .context(EngineSnafu { stage: "regenerate" })?;
                self.stream_reply().await
            }
            Command::Edit { index, text } => {
                let id = self.message_at(index)?;
                let outcome = self
                    .engine
                    .edit(id, &text)
                    .context(EngineSnafu { stage: "edit" })?;
                match outcome {
                    EditOutcome::Updated => self.say("message updated").await,
                    EditOutcome::Resubmitted => self.stream_reply().await,
                }
            }
            Command::Delete { index } => {
                let id = self.message_at(index)?;
                self.engine
                    .delete(id)
                    .context(EngineSnafu { stage: "delete" })?;
                self.say("message deleted").await
            }
            Command::Pin { index } => {
                let id = self.message_at(index)?;
                let pinned = self
                    .engine
                    .toggle_pin(id)
                    .context(EngineSnafu { stage: "pin" })?;
                self.say(if pinned { "pinned" } else { "unpinned" }).await
            }
            Command::Fold { index } => {
                let id = self.message_at(index)?;
                let folded = self
                    .engine
                    .toggle_fold(id)
                    .context(EngineSnafu { stage: "fold" })?;
                self.say(if folded { "folded" } else { "unfolded" }).await
            }
            Command::React { index, reaction } => {
                let id = self.message_at(index)?;
                self.engine
                    .set_reaction(id, reaction)
                    .context(EngineSnafu { stage: "react" })?;
                self.say("reaction saved").await
            }
            Command::Draft(text) => {
                self.engine
                    .set_draft(&text)
                    .context(EngineSnafu { stage: "draft" })?;
                self.say("draft saved").await
            }
            Command::History => self.print_history().await,
            Command::New => {
                self.engine.new_session();
                self.say("started a new conversation").await
            }
            Command::Sessions => {
                self.sync_sessions().await?;
                self.print_sessions().await
            }
            Command::ToggleArchivedView => {
                self.filter.show_archived = !self.filter.show_archived;
                self.print_sessions().await
            }
            Command::Search(query) => self.search(&query).await,
            Command::Open(raw) => self.open(&raw).await,
            Command::Rename(title) => self.rename(&title).await,
            Command::Remove(raw) => self.remove(&raw).await,
            Command::Favorite => {
                let on = self
                    .engine
                    .toggle_favorite()
                    .context(EngineSnafu { stage: "favorite" })?;
                self.say(if on { "added to favorites" } else { "removed from favorites" })
                    .await
            }
            Command::Archive => {
                let on = self
                    .engine
                    .toggle_archived()
                    .context(EngineSnafu { stage: "archive" })?;
                self.say(if on { "archived" } else { "unarchived" }).await
            }
            Command::PurgeArchived => self.purge_archived().await,
            Command::Export(format) => self.export(format).await,
            Command::Tokens => {
                let usage = self.engine.token_usage();
                self.say(&format!(
                    "tokens: {} in, {} out, {} total",
                    usage.input,
                    usage.output,
                    usage.total()
                ))
                .await
            }
            Command::Help => self.say(HELP).await,
            Command::Quit => Ok(()),
        }
    }

    /// Prints updates until the generation settles. Ctrl-C cancels it, and
    /// so does a terminal write failure before the error is returned.
    async fn stream_reply(&mut self) -> AppResult<()> {
        let watcher = self.engine.cancel_token().map(|token| {
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => token.cancel(),
                    _ = token.cancelled() => {}
                }
            })
        });

        let outcome = self.print_updates().await;
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        if outcome.is_err() && self.engine.cancel() {
            tracing::debug!("cancelled the reply after a terminal failure");
        }
        outcome
    }

    async fn print_updates(&mut self) -> AppResult<()> {
        while let Some(update) = self.engine.next_update().await {
            match update {
                EngineUpdate::Delta(text) => self.write(&text).await?,
                EngineUpdate::Committed(_) => self.write("\n").await?,
                EngineUpdate::FollowUps { suggestions, .. } => {
                    self.write(&render_follow_ups(&suggestions)).await?
                }
                EngineUpdate::Failed { error } => {
                    tracing::debug!(error = %error, "reply failed");
                    let fallback = self
                        .engine
                        .messages()
                        .last()
                        .map(|message| message.content.clone())
                        .unwrap_or_default();
                    self.say(&format!("\n{fallback}")).await?;
                }
                EngineUpdate::Cancelled => self.say("\n[stopped]").await?,
            }
        }
        Ok(())
    }

    async fn sync_sessions(&mut self) -> AppResult<()> {
        match self.backend.list_sessions().await {
            Ok(remote) => {
                let summaries = remote
                    .iter()
                    .filter_map(SessionSummary::from_remote)
                    .collect();
                self.engine
                    .reconcile_sessions(summaries)
                    .context(EngineSnafu {
                        stage: "sync-sessions",
                    })?;
            }
            Err(error) => {
                tracing::warn!(error = %error, "could not list remote sessions, showing local list");
            }
        }
        Ok(())
    }

    async fn print_sessions(&mut self) -> AppResult<()> {
        self.listed = self
            .engine
            .filtered_sessions(&self.filter)
            .context(EngineSnafu {
                stage: "list-sessions",
            })?;
        let favorites = self
            .engine
            .annotations()
            .favorites()
            .context(StorageSnafu {
                stage: "list-favorites",
            })?;

        let heading = if self.filter.show_archived {
            "archived sessions"
        } else {
            "sessions"
        };
        let mut text = format!("{heading}:\n");
        if self.listed.is_empty() {
            text.push_str("  (none)\n");
        }
        for summary in &self.listed {
            let marker = if favorites.contains(&summary.key()) { "*" } else { " " };
            text.push_str(&format!("{marker} {}  {}\n", summary.id, summary.title));
        }
        self.write(&text).await
    }

    async fn print_history(&mut self) -> AppResult<()> {
        let session = self.engine.session();
        let mut text = format!("{}\n", session.display_title());
        for (position, message) in session.messages.iter().enumerate() {
            let body = transcript(std::slice::from_ref(message));
            text.push_str(&format!("[{}] {body}\n", position + 1));
        }
        self.write(&text).await
    }

    async fn search(&mut self, query: &str) -> AppResult<()> {
        match self.backend.search_sessions(query).await {
            Ok(remote) => {
                let mut text = format!("results for \"{query}\":\n");
                if remote.is_empty() {
                    text.push_str("  (none)\n");
                }
                for session in &remote {
                    text.push_str(&format!("  {}  {}\n", session.session_id, session.title));
                }
                self.write(&text).await
            }
            Err(error) => {
                tracing::warn!(error = %error, "remote search failed, filtering locally");
                self.filter.query = query.to_string();
                let outcome = self.print_sessions().await;
                self.filter.query.clear();
                outcome
            }
        }
    }

    async fn open(&mut self, raw: &str) -> AppResult<()> {
        let id = self.resolve_session(raw)?;
        let remote = self
            .backend
            .get_session(id.as_str())
            .await
            .context(BackendSnafu {
                stage: "open-session",
            })?;
        self.engine
            .open_session(Session::from_remote(remote))
            .context(EngineSnafu {
                stage: "open-session",
            })?;

        let draft = self.engine.draft().context(EngineSnafu {
            stage: "open-session-draft",
        })?;
        self.print_history().await?;
        if !draft.is_empty() {
            self.say(&format!("draft: {draft}")).await?;
        }
        Ok(())
    }

    async fn rename(&mut self, title: &str) -> AppResult<()> {
        let id = self.engine.session().id.clone().context(InvalidCommandSnafu {
            stage: "rename",
            details: "this conversation has no id yet; send a message first",
        })?;
        self.backend
            .rename_session(id.as_str(), title)
            .await
            .context(BackendSnafu {
                stage: "rename-session",
            })?;
        self.engine
            .rename_session(&id, title)
            .context(EngineSnafu {
                stage: "rename-session",
            })?;
        self.say("renamed").await
    }

    async fn remove(&mut self, raw: &str) -> AppResult<()> {
        let id = self.resolve_session(raw)?;
        if let Err(error) = self.backend.delete_session(id.as_str()).await {
            tracing::warn!(session = %id, error = %error, "remote delete failed, removing locally");
        }
        let removed = self
            .engine
            .delete_session(&id)
            .context(EngineSnafu {
                stage: "remove-session",
            })?;
        self.say(if removed { "session removed" } else { "session was not listed locally" })
            .await
    }

    async fn purge_archived(&mut self) -> AppResult<()> {
        let removed = self
            .engine
            .delete_archived_sessions()
            .context(EngineSnafu {
                stage: "purge-archived",
            })?;
        for id in &removed {
            if let Err(error) = self.backend.delete_session(id.as_str()).await {
                tracing::warn!(session = %id, error = %error, "remote delete failed");
            }
        }
        self.say(&format!("removed {} archived sessions", removed.len()))
            .await
    }

    async fn export(&mut self, format: ExportFormat) -> AppResult<()> {
        if let Some(id) = self.engine.session().id.clone() {
            match self.backend.export_session(id.as_str(), format).await {
                Ok(ExportPayload::Markdown(markdown)) => return self.say(&markdown).await,
                Ok(ExportPayload::Json(remote)) => {
                    let text = export_json(&Session::from_remote(remote)).context(ExportSnafu {
                        stage: "export-remote-json",
                    })?;
                    return self.say(&text).await;
                }
                Err(error) => {
                    tracing::warn!(session = %id, error = %error, "remote export failed, exporting local copy");
                }
            }
        }

        let session = self.engine.session();
        let text = match format {
            ExportFormat::Json => export_json(session).context(ExportSnafu {
                stage: "export-local-json",
            })?,
            ExportFormat::Markdown => export_markdown(session),
        };
        self.say(&text).await
    }

    /// Accepts a raw session id or a 1-based position in the last listing.
    fn resolve_session(&self, raw: &str) -> AppResult<SessionId> {
        if let Ok(position) = raw.parse::<usize>()
            && let Some(summary) = position.checked_sub(1).and_then(|at| self.listed.get(at))
        {
            return Ok(summary.id.clone());
        }
        SessionId::new(raw).map_err(|error| AppError::InvalidCommand {
            stage: "resolve-session",
            details: error.to_string(),
        })
    }

    fn message_at(&self, index: usize) -> AppResult<MessageId> {
        self.engine
            .messages()
            .get(index.wrapping_sub(1))
            .map(|message| message.id)
            .context(InvalidCommandSnafu {
                stage: "message-at",
                details: format!("there is no message {index}; see /history"),
            })
    }

    async fn say(&mut self, text: &str) -> AppResult<()> {
        self.write(text).await?;
        if !text.ends_with('\n') {
            self.write("\n").await?;
        }
        Ok(())
    }

    async fn write(&mut self, text: &str) -> AppResult<()> {
        self.out
            .write_all(text.as_bytes())
            .await
            .context(TerminalSnafu { stage: "write" })?;
        self.out
            .flush()
            .await
            .context(TerminalSnafu { stage: "flush" })
    }
}

fn render_follow_ups(suggestions: &[String]) -> String {
    let mut text = String::from("suggested:\n");
    for question in suggestions {
        text.push_str(&format!("  - {question}\n"));
    }
    text
}

/// Builds the app from settings and runs it to completion.
pub async fn run(settings: &ClientSettings) -> AppResult<()> {
    let mut app = App::new(settings).await?;
    app.run().await
}
