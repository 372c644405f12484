use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snafu::ensure;

use super::KeyValueStore;
use super::error::{InvalidKeySnafu, StorageResult};
use super::id_set::IdSet;
use super::ids::{MessageId, SessionId, SessionKey, TentativeSessionId};
use super::keys::{
    ARCHIVED_KEY, FAVORITES_KEY, FOLDERS_KEY, TAGS_KEY, draft_key, folded_key, pinned_key,
    reactions_key, read_json, write_json,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reaction {
    Up,
    Down,
}

pub type ReactionMap = BTreeMap<MessageId, Reaction>;
pub type FolderMap = BTreeMap<SessionKey, String>;
pub type TagMap = BTreeMap<SessionKey, Vec<String>>;

/// Local-only metadata layered over sessions and messages.
///
/// Records live in their own key spaces and are never touched by message
/// commits, so they outlive engine resets and session reloads. Empty
/// collections are stored as absent keys.
#[derive(Clone)]
pub struct LocalAnnotationStore {
    store: Arc<dyn KeyValueStore>,
}

impl LocalAnnotationStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn draft(&self, session: &SessionKey) -> StorageResult<String> {
        Ok(read_json::<String>(self.store.as_ref(), &draft_key(session), "draft-read")?
            .unwrap_or_default())
    }

    /// Stores the unsent input text; blank text clears the draft.
    pub fn set_draft(&self, session: &SessionKey, text: &str) -> StorageResult<()> {
        let key = draft_key(session);
        if text.trim().is_empty() {
            return self.store.delete(&key);
        }
        write_json(self.store.as_ref(), &key, text, "draft-write")
    }

    pub fn clear_draft(&self, session: &SessionKey) -> StorageResult<()> {
        self.store.delete(&draft_key(session))
    }

    pub fn pinned(&self, session: &SessionKey) -> StorageResult<IdSet<MessageId>> {
        self.read_set(&pinned_key(session), "pinned-read")
    }

    pub fn toggle_pin(&self, session: &SessionKey, message: MessageId) -> StorageResult<bool> {
        let key = pinned_key(session);
        let mut pinned = self.read_set(&key, "pinned-read")?;
        let now_pinned = pinned.toggle(message);
        self.write_set(&key, &pinned, "pinned-write")?;
        Ok(now_pinned)
    }

    pub fn reactions(&self, session: &SessionKey) -> StorageResult<ReactionMap> {
        Ok(
            read_json(self.store.as_ref(), &reactions_key(session), "reactions-read")?
                .unwrap_or_default(),
        )
    }

    /// Sets or clears the reaction on one message.
    pub fn set_reaction(
        &self,
        session: &SessionKey,
        message: MessageId,
        reaction: Option<Reaction>,
    ) -> StorageResult<()> {
        let mut reactions = self.reactions(session)?;
        match reaction {
            Some(reaction) => reactions.insert(message, reaction),
            None => reactions.remove(&message),
        };
        self.write_map(&reactions_key(session), &reactions, "reactions-write")
    }

    pub fn folded(&self, session: &SessionKey) -> StorageResult<IdSet<MessageId>> {
        self.read_set(&folded_key(session), "folded-read")
    }

    pub fn toggle_fold(&self, session: &SessionKey, message: MessageId) -> StorageResult<bool> {
        let key = folded_key(session);
        let mut folded = self.read_set(&key, "folded-read")?;
        let now_folded = folded.toggle(message);
        self.write_set(&key, &folded, "folded-write")?;
        Ok(now_folded)
    }

    pub fn favorites(&self) -> StorageResult<IdSet<SessionKey>> {
        self.read_set(FAVORITES_KEY, "favorites-read")
    }

    pub fn toggle_favorite(&self, session: &SessionKey) -> StorageResult<bool> {
        let mut favorites = self.favorites()?;
        let now_favorite = favorites.toggle(session.clone());
        self.write_set(FAVORITES_KEY, &favorites, "favorites-write")?;
        Ok(now_favorite)
    }

    pub fn archived(&self) -> StorageResult<IdSet<SessionKey>> {
        self.read_set(ARCHIVED_KEY, "archived-read")
    }

    pub fn toggle_archived(&self, session: &SessionKey) -> StorageResult<bool> {
        let mut archived = self.archived()?;
        let now_archived = archived.toggle(session.clone());
        self.write_set(ARCHIVED_KEY, &archived, "archived-write")?;
        Ok(now_archived)
    }

    pub fn folders(&self) -> StorageResult<FolderMap> {
        Ok(read_json(self.store.as_ref(), FOLDERS_KEY, "folders-read")?.unwrap_or_default())
    }

    /// Moves a session into a folder; `None` or a blank name removes it.
    pub fn set_folder(&self, session: &SessionKey, folder: Option<&str>) -> StorageResult<()> {
        let mut folders = self.folders()?;
        match folder.map(str::trim).filter(|folder| !folder.is_empty()) {
            Some(folder) => folders.insert(session.clone(), folder.to_string()),
            None => folders.remove(session),
        };
        self.write_map(FOLDERS_KEY, &folders, "folders-write")
    }

    pub fn tags(&self) -> StorageResult<TagMap> {
        Ok(read_json(self.store.as_ref(), TAGS_KEY, "tags-read")?.unwrap_or_default())
    }

    /// Adds a tag, keeping insertion order. Returns `false` for duplicates.
    pub fn add_tag(&self, session: &SessionKey, tag: &str) -> StorageResult<bool> {
        let tag = tag.trim();
        ensure!(
            !tag.is_empty(),
            InvalidKeySnafu {
                stage: "tags-add",
                key: session.to_string(),
                details: "tag must not be blank",
            }
        );

        let mut tags = self.tags()?;
        let entry = tags.entry(session.clone()).or_default();
        if entry.iter().any(|existing| existing == tag) {
            return Ok(false);
        }
        entry.push(tag.to_string());
        self.write_map(TAGS_KEY, &tags, "tags-write")?;
        Ok(true)
    }

    pub fn remove_tag(&self, session: &SessionKey, tag: &str) -> StorageResult<bool> {
        let mut tags = self.tags()?;
        let Some(entry) = tags.get_mut(session) else {
            return Ok(false);
        };
        let before = entry.len();
        entry.retain(|existing| existing != tag.trim());
        let removed = entry.len() != before;
        if entry.is_empty() {
            tags.remove(session);
        }
        if removed {
            self.write_map(TAGS_KEY, &tags, "tags-write")?;
        }
        Ok(removed)
    }

    /// Moves every record kept under a tentative key to the server-assigned id.
    ///
    /// Records that already exist under the assigned id are merged; the
    /// tentative side wins on conflicting reactions and drafts.
    pub fn adopt_identity(
        &self,
        tentative: TentativeSessionId,
        assigned: &SessionId,
    ) -> StorageResult<()> {
        let from = SessionKey::Tentative(tentative);
        let to = SessionKey::Assigned(assigned.clone());

        let draft = self.draft(&from)?;
        if !draft.trim().is_empty() {
            self.set_draft(&to, &draft)?;
        }

        let mut pinned = self.pinned(&to)?;
        pinned.extend(self.pinned(&from)?);
        self.write_set(&pinned_key(&to), &pinned, "adopt-pinned")?;

        let mut reactions = self.reactions(&to)?;
        reactions.extend(self.reactions(&from)?);
        self.write_map(&reactions_key(&to), &reactions, "adopt-reactions")?;

        let mut folded = self.folded(&to)?;
        folded.extend(self.folded(&from)?);
        self.write_set(&folded_key(&to), &folded, "adopt-folded")?;

        let mut favorites = self.favorites()?;
        if favorites.remove(&from) {
            favorites.insert(to.clone());
            self.write_set(FAVORITES_KEY, &favorites, "adopt-favorites")?;
        }

        let mut archived = self.archived()?;
        if archived.remove(&from) {
            archived.insert(to.clone());
            self.write_set(ARCHIVED_KEY, &archived, "adopt-archived")?;
        }

        let mut folders = self.folders()?;
        if let Some(folder) = folders.remove(&from) {
            folders.insert(to.clone(), folder);
            self.write_map(FOLDERS_KEY, &folders, "adopt-folders")?;
        }

        let mut tags = self.tags()?;
        if let Some(moved) = tags.remove(&from) {
            let entry = tags.entry(to.clone()).or_default();
            for tag in moved {
                if !entry.contains(&tag) {
                    entry.push(tag);
                }
            }
            self.write_map(TAGS_KEY, &tags, "adopt-tags")?;
        }

        self.delete_session_records(&from)?;
        tracing::debug!(tentative = %from, assigned = %to, "adopted tentative annotations");
        Ok(())
    }

    /// Drops everything recorded for a session that never received an id.
    pub fn discard(&self, tentative: TentativeSessionId) -> StorageResult<()> {
        self.purge_session(&SessionKey::Tentative(tentative))
    }

    /// Removes a session from every key space.
    pub fn purge_session(&self, session: &SessionKey) -> StorageResult<()> {
        self.delete_session_records(session)?;

        let mut favorites = self.favorites()?;
        if favorites.remove(session) {
            self.write_set(FAVORITES_KEY, &favorites, "purge-favorites")?;
        }

        let mut archived = self.archived()?;
        if archived.remove(session) {
            self.write_set(ARCHIVED_KEY, &archived, "purge-archived")?;
        }

        let mut folders = self.folders()?;
        if folders.remove(session).is_some() {
            self.write_map(FOLDERS_KEY, &folders, "purge-folders")?;
        }

        let mut tags = self.tags()?;
        if tags.remove(session).is_some() {
            self.write_map(TAGS_KEY, &tags, "purge-tags")?;
        }

        Ok(())
    }

    fn delete_session_records(&self, session: &SessionKey) -> StorageResult<()> {
        self.store.delete(&draft_key(session))?;
        self.store.delete(&pinned_key(session))?;
        self.store.delete(&reactions_key(session))?;
        self.store.delete(&folded_key(session))
    }

    fn read_set<T>(&self, key: &str, stage: &'static str) -> StorageResult<IdSet<T>>
    where
        T: Ord + serde::de::DeserializeOwned,
    {
        Ok(read_json(self.store.as_ref(), key, stage)?.unwrap_or_default())
    }

    fn write_set<T>(&self, key: &str, set: &IdSet<T>, stage: &'static str) -> StorageResult<()>
    where
        T: Ord + Serialize,
    {
        if set.is_empty() {
            return self.store.delete(key);
        }
        write_json(self.store.as_ref(), key, set, stage)
    }

    fn write_map<K, V>(
        &self,
        key: &str,
        map: &BTreeMap<K, V>,
        stage: &'static str,
    ) -> StorageResult<()>
    where
        K: Ord + Serialize,
        V: Serialize,
    {
        if map.is_empty() {
            return self.store.delete(key);
        }
        write_json(self.store.as_ref(), key, map, stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn annotations() -> (Arc<MemoryStore>, LocalAnnotationStore) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), LocalAnnotationStore::new(store))
    }

    fn assigned(raw: &str) -> SessionKey {
        SessionKey::Assigned(SessionId::new(raw).unwrap())
    }

    #[test]
    fn pins_and_folds_toggle_independently() {
        let (_, annotations) = annotations();
        let session = assigned("S1");
        let message = MessageId::new_v7();

        assert!(annotations.toggle_pin(&session, message).unwrap());
        assert!(annotations.pinned(&session).unwrap().contains(&message));
        assert!(annotations.folded(&session).unwrap().is_empty());

        assert!(annotations.toggle_fold(&session, message).unwrap());
        assert!(!annotations.toggle_pin(&session, message).unwrap());
        assert!(annotations.pinned(&session).unwrap().is_empty());
        assert!(annotations.folded(&session).unwrap().contains(&message));
    }

    #[test]
    fn save_then_load_reproduces_identical_structures() {
        let (store, annotations) = annotations();
        let session = assigned("S1");
        let first = MessageId::new_v7();
        let second = MessageId::new_v7();

        annotations.toggle_pin(&session, second).unwrap();
        annotations.toggle_pin(&session, first).unwrap();
        annotations
            .set_reaction(&session, first, Some(Reaction::Up))
            .unwrap();
        annotations
            .set_reaction(&session, second, Some(Reaction::Down))
            .unwrap();

        let reloaded = LocalAnnotationStore::new(store);
        let expected_pins: IdSet<MessageId> = [first, second].into_iter().collect();
        assert_eq!(reloaded.pinned(&session).unwrap(), expected_pins);

        let reactions = reloaded.reactions(&session).unwrap();
        assert_eq!(reactions.get(&first), Some(&Reaction::Up));
        assert_eq!(reactions.get(&second), Some(&Reaction::Down));

        reloaded.set_reaction(&session, first, None).unwrap();
        assert_eq!(reloaded.reactions(&session).unwrap().len(), 1);
    }

    #[test]
    fn blank_draft_clears_the_key() {
        let (store, annotations) = annotations();
        let session = assigned("S1");

        annotations.set_draft(&session, "half a thought").unwrap();
        assert_eq!(annotations.draft(&session).unwrap(), "half a thought");

        annotations.set_draft(&session, "   ").unwrap();
        assert_eq!(annotations.draft(&session).unwrap(), "");
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn tags_are_deduplicated_in_insertion_order() {
        let (_, annotations) = annotations();
        let session = assigned("S1");

        assert!(annotations.add_tag(&session, "work").unwrap());
        assert!(annotations.add_tag(&session, " rust ").unwrap());
        assert!(!annotations.add_tag(&session, "work").unwrap());
        assert!(annotations.add_tag(&session, " ").is_err());

        assert_eq!(annotations.tags().unwrap()[&session], vec!["work", "rust"]);
        assert!(annotations.remove_tag(&session, "work").unwrap());
        assert!(!annotations.remove_tag(&session, "work").unwrap());
    }

    #[test]
    fn tentative_records_move_to_the_assigned_id() {
        let (store, annotations) = annotations();
        let tentative = TentativeSessionId::new_v7();
        let from = SessionKey::Tentative(tentative);
        let message = MessageId::new_v7();

        annotations.set_draft(&from, "draft").unwrap();
        annotations.toggle_pin(&from, message).unwrap();
        annotations
            .set_reaction(&from, message, Some(Reaction::Up))
            .unwrap();
        annotations.toggle_favorite(&from).unwrap();
        annotations.set_folder(&from, Some("Research")).unwrap();
        annotations.add_tag(&from, "ml").unwrap();

        let assigned_id = SessionId::new("S1").unwrap();
        annotations.adopt_identity(tentative, &assigned_id).unwrap();
        let to = SessionKey::Assigned(assigned_id);

        assert_eq!(annotations.draft(&to).unwrap(), "draft");
        assert!(annotations.pinned(&to).unwrap().contains(&message));
        assert_eq!(
            annotations.reactions(&to).unwrap().get(&message),
            Some(&Reaction::Up)
        );
        assert!(annotations.favorites().unwrap().contains(&to));
        assert!(!annotations.favorites().unwrap().contains(&from));
        assert_eq!(annotations.folders().unwrap()[&to], "Research");
        assert_eq!(annotations.tags().unwrap()[&to], vec!["ml"]);

        let leftovers = store
            .keys()
            .unwrap()
            .into_iter()
            .filter(|key| key.contains("tentative:"))
            .collect::<Vec<_>>();
        assert!(leftovers.is_empty(), "{leftovers:?}");
        let favorites_raw = store.get(FAVORITES_KEY).unwrap().unwrap();
        assert!(!favorites_raw.contains("tentative:"));
    }

    #[test]
    fn discard_drops_tentative_records() {
        let (store, annotations) = annotations();
        let tentative = TentativeSessionId::new_v7();
        let key = SessionKey::Tentative(tentative);

        annotations.set_draft(&key, "unsent").unwrap();
        annotations.toggle_archived(&key).unwrap();
        annotations.discard(tentative).unwrap();

        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn purge_leaves_other_sessions_alone() {
        let (_, annotations) = annotations();
        let kept = assigned("S1");
        let removed = assigned("S2");

        annotations.toggle_favorite(&kept).unwrap();
        annotations.toggle_favorite(&removed).unwrap();
        annotations.set_folder(&removed, Some("Old")).unwrap();
        annotations.purge_session(&removed).unwrap();

        let favorites = annotations.favorites().unwrap();
        assert!(favorites.contains(&kept));
        assert!(!favorites.contains(&removed));
        assert!(annotations.folders().unwrap().is_empty());
    }
}
