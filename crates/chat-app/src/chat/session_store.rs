use std::sync::Arc;

use kestrel_llm::RemoteSession;
use kestrel_storage::{KeyValueStore, LocalAnnotationStore, SESSIONS_KEY, read_json, write_json};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, ensure};

use crate::chat::error::{EmptyInputSnafu, EngineResult, StorageSnafu, UnknownSessionSnafu};
use crate::chat::message::{SessionId, SessionKey, unix_timestamp_seconds};

/// Persisted sidebar entry for one identified session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub title: String,
    pub created_at: u64,
    pub updated_at: u64,
}

impl SessionSummary {
    pub fn new(id: SessionId, title: impl Into<String>) -> Self {
        let now = unix_timestamp_seconds();
        Self {
            id,
            title: title.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn from_remote(remote: &RemoteSession) -> Option<Self> {
        match SessionId::new(remote.session_id.clone()) {
            Ok(id) => Some(Self::new(id, remote.title.clone())),
            Err(error) => {
                tracing::warn!(session = %remote.session_id, error = %error, "skipping remote session");
                None
            }
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey::Assigned(self.id.clone())
    }
}

/// Sidebar filter over the session list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    /// Case-insensitive title search; blank matches everything.
    pub query: String,
    pub favorites_only: bool,
    /// When on, only archived sessions are listed; when off, they are hidden.
    pub show_archived: bool,
    pub folder: Option<String>,
}

/// Ordered list of session summaries, newest first.
///
/// Every mutation is written through to the key-value store before it
/// returns. A failed write leaves the in-memory list untouched.
pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
    summaries: Vec<SessionSummary>,
}

impl SessionStore {
    pub fn load(store: Arc<dyn KeyValueStore>) -> EngineResult<Self> {
        let summaries = read_json::<Vec<SessionSummary>>(store.as_ref(), SESSIONS_KEY, "sessions-read")
            .context(StorageSnafu {
                stage: "session-store-load",
            })?
            .unwrap_or_default();

        Ok(Self { store, summaries })
    }

    pub fn summaries(&self) -> &[SessionSummary] {
        &self.summaries
    }

    pub fn get(&self, id: &SessionId) -> Option<&SessionSummary> {
        self.summaries.iter().find(|summary| &summary.id == id)
    }

    /// Replaces a known entry in place or prepends a new one.
    pub fn upsert(&mut self, summary: SessionSummary) -> EngineResult<()> {
        let mut next = self.summaries.clone();
        match next.iter_mut().find(|existing| existing.id == summary.id) {
            Some(existing) => {
                existing.title = summary.title;
                existing.updated_at = summary.updated_at;
            }
            None => next.insert(0, summary),
        }
        self.replace(next, "session-store-upsert")
    }

    /// Changes only the title of a known session.
    pub fn rename(&mut self, id: &SessionId, title: &str) -> EngineResult<()> {
        let title = title.trim();
        ensure!(
            !title.is_empty(),
            EmptyInputSnafu {
                stage: "session-store-rename",
            }
        );

        let mut next = self.summaries.clone();
        let summary = next
            .iter_mut()
            .find(|summary| &summary.id == id)
            .context(UnknownSessionSnafu {
                stage: "session-store-rename",
                session: id.to_string(),
            })?;
        summary.title = title.to_string();
        self.replace(next, "session-store-rename")
    }

    /// Returns whether the session was present.
    pub fn remove(&mut self, id: &SessionId) -> EngineResult<bool> {
        let mut next = self.summaries.clone();
        next.retain(|summary| &summary.id != id);
        if next.len() == self.summaries.len() {
            return Ok(false);
        }
        self.replace(next, "session-store-remove")?;
        Ok(true)
    }

    /// Merges the backend's session list.
    ///
    /// Known entries keep their position and take the remote title; unknown
    /// entries are appended in remote order.
    pub fn reconcile(&mut self, remote: Vec<SessionSummary>) -> EngineResult<()> {
        let mut next = self.summaries.clone();
        for incoming in remote {
            match next.iter_mut().find(|existing| existing.id == incoming.id) {
                Some(existing) => {
                    if !incoming.title.trim().is_empty() {
                        existing.title = incoming.title;
                    }
                }
                None => next.push(incoming),
            }
        }
        self.replace(next, "session-store-reconcile")
    }

    pub fn filtered(
        &self,
        filter: &SessionFilter,
        annotations: &LocalAnnotationStore,
    ) -> EngineResult<Vec<SessionSummary>> {
        let favorites = annotations.favorites().context(StorageSnafu {
            stage: "session-filter-favorites",
        })?;
        let archived = annotations.archived().context(StorageSnafu {
            stage: "session-filter-archived",
        })?;
        let folders = annotations.folders().context(StorageSnafu {
            stage: "session-filter-folders",
        })?;
        let query = filter.query.trim().to_lowercase();

        Ok(self
            .summaries
            .iter()
            .filter(|summary| {
                let key = summary.key();
                if archived.contains(&key) != filter.show_archived {
                    return false;
                }
                if filter.favorites_only && !favorites.contains(&key) {
                    return false;
                }
                if let Some(folder) = filter.folder.as_deref()
                    && folders.get(&key).map(String::as_str) != Some(folder)
                {
                    return false;
                }
                query.is_empty() || summary.title.to_lowercase().contains(&query)
            })
            .cloned()
            .collect())
    }

    /// Writes `next` and adopts it only once the write succeeded.
    fn replace(&mut self, next: Vec<SessionSummary>, stage: &'static str) -> EngineResult<()> {
        write_json(self.store.as_ref(), SESSIONS_KEY, &next, "sessions-write")
            .context(StorageSnafu { stage })?;
        self.summaries = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use kestrel_storage::{MemoryStore, StorageError, StorageResult};

    use super::*;
    use crate::chat::error::ErrorKind;

    /// Memory store whose writes can be switched off.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        reject_writes: AtomicBool,
    }

    impl FlakyStore {
        fn reject_writes(&self) {
            self.reject_writes.store(true, Ordering::SeqCst);
        }

        fn check(&self, stage: &'static str) -> StorageResult<()> {
            if self.reject_writes.load(Ordering::SeqCst) {
                return Err(StorageError::InvariantViolation {
                    stage,
                    details: "disk full".to_string(),
                });
            }
            Ok(())
        }
    }

    impl KeyValueStore for FlakyStore {
        fn get(&self, key: &str) -> StorageResult<Option<String>> {
            self.inner.get(key)
        }

        fn set(&self, key: &str, value: &str) -> StorageResult<()> {
            self.check("flaky-set")?;
            self.inner.set(key, value)
        }

        fn delete(&self, key: &str) -> StorageResult<()> {
            self.check("flaky-delete")?;
            self.inner.delete(key)
        }
    }

    fn id(raw: &str) -> SessionId {
        SessionId::new(raw).unwrap()
    }

    fn titles(summaries: &[SessionSummary]) -> Vec<&str> {
        summaries
            .iter()
            .map(|summary| summary.title.as_str())
            .collect()
    }

    #[test]
    fn new_sessions_are_prepended_and_updates_keep_position() {
        let store = Arc::new(MemoryStore::new());
        let mut sessions = SessionStore::load(store.clone()).unwrap();

        sessions.upsert(SessionSummary::new(id("S1"), "first")).unwrap();
        sessions.upsert(SessionSummary::new(id("S2"), "second")).unwrap();
        sessions.upsert(SessionSummary::new(id("S1"), "first again")).unwrap();
        assert_eq!(titles(sessions.summaries()), vec!["second", "first again"]);

        let reloaded = SessionStore::load(store).unwrap();
        assert_eq!(reloaded.summaries(), sessions.summaries());
    }

    #[test]
    fn rename_rejects_blank_and_unknown() {
        let mut sessions = SessionStore::load(Arc::new(MemoryStore::new())).unwrap();
        sessions.upsert(SessionSummary::new(id("S1"), "first")).unwrap();

        let blank = sessions.rename(&id("S1"), "  ").unwrap_err();
        assert_eq!(blank.kind(), ErrorKind::Validation);
        assert!(sessions.rename(&id("S9"), "x").is_err());

        sessions.rename(&id("S1"), " Renamed ").unwrap();
        assert_eq!(sessions.get(&id("S1")).unwrap().title, "Renamed");
    }

    #[test]
    fn reconcile_keeps_known_positions() {
        let mut sessions = SessionStore::load(Arc::new(MemoryStore::new())).unwrap();
        sessions.upsert(SessionSummary::new(id("S1"), "one")).unwrap();
        sessions.upsert(SessionSummary::new(id("S2"), "two")).unwrap();

        sessions
            .reconcile(vec![
                SessionSummary::new(id("S3"), "three"),
                SessionSummary::new(id("S1"), "one (remote)"),
            ])
            .unwrap();
        assert_eq!(
            titles(sessions.summaries()),
            vec!["two", "one (remote)", "three"]
        );
    }

    #[test]
    fn filter_honours_search_favorites_archive_and_folder() {
        let store = Arc::new(MemoryStore::new());
        let annotations = LocalAnnotationStore::new(store.clone());
        let mut sessions = SessionStore::load(store).unwrap();
        sessions.upsert(SessionSummary::new(id("S1"), "Rust lifetimes")).unwrap();
        sessions.upsert(SessionSummary::new(id("S2"), "Cooking")).unwrap();
        sessions.upsert(SessionSummary::new(id("S3"), "Rust async")).unwrap();

        annotations.toggle_favorite(&SessionKey::Assigned(id("S1"))).unwrap();
        annotations.toggle_archived(&SessionKey::Assigned(id("S3"))).unwrap();
        annotations
            .set_folder(&SessionKey::Assigned(id("S2")), Some("Home"))
            .unwrap();

        let search = SessionFilter {
            query: "rust".to_string(),
            ..SessionFilter::default()
        };
        assert_eq!(
            titles(&sessions.filtered(&search, &annotations).unwrap()),
            vec!["Rust lifetimes"]
        );

        let archived = SessionFilter {
            show_archived: true,
            ..SessionFilter::default()
        };
        assert_eq!(
            titles(&sessions.filtered(&archived, &annotations).unwrap()),
            vec!["Rust async"]
        );

        let favorites = SessionFilter {
            favorites_only: true,
            ..SessionFilter::default()
        };
        assert_eq!(
            titles(&sessions.filtered(&favorites, &annotations).unwrap()),
            vec!["Rust lifetimes"]
        );

        let folder = SessionFilter {
            folder: Some("Home".to_string()),
            ..SessionFilter::default()
        };
        assert_eq!(
            titles(&sessions.filtered(&folder, &annotations).unwrap()),
            vec!["Cooking"]
        );
    }

    #[test]
    fn failed_writes_leave_the_list_unchanged() {
        let store = Arc::new(FlakyStore::default());
        let mut sessions = SessionStore::load(store.clone()).unwrap();
        sessions.upsert(SessionSummary::new(id("S1"), "one")).unwrap();
        let before = sessions.summaries().to_vec();
        store.reject_writes();

        let error = sessions
            .upsert(SessionSummary::new(id("S2"), "two"))
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Storage);
        assert!(sessions.rename(&id("S1"), "renamed").is_err());
        assert!(sessions.remove(&id("S1")).is_err());
        assert!(
            sessions
                .reconcile(vec![SessionSummary::new(id("S3"), "three")])
                .is_err()
        );

        assert_eq!(sessions.summaries(), before.as_slice());
        assert_eq!(SessionStore::load(store).unwrap().summaries(), before.as_slice());
    }

    #[test]
    fn remove_reports_presence() {
        let mut sessions = SessionStore::load(Arc::new(MemoryStore::new())).unwrap();
        sessions.upsert(SessionSummary::new(id("S1"), "one")).unwrap();
        assert!(sessions.remove(&id("S1")).unwrap());
        assert!(!sessions.remove(&id("S1")).unwrap());
        assert!(sessions.summaries().is_empty());
    }
}
