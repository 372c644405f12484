use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::ResultExt;

use super::KeyValueStore;
use super::error::{DecodeValueSnafu, EncodeValueSnafu, StorageResult};
use super::ids::SessionKey;

pub const SESSIONS_KEY: &str = "sessions";
pub const FAVORITES_KEY: &str = "favorites";
pub const ARCHIVED_KEY: &str = "archived";
pub const FOLDERS_KEY: &str = "folders";
pub const TAGS_KEY: &str = "tags";

pub fn draft_key(session: &SessionKey) -> String {
    format!("draft:{session}")
}

pub fn pinned_key(session: &SessionKey) -> String {
    format!("pinned:{session}")
}

pub fn reactions_key(session: &SessionKey) -> String {
    format!("reactions:{session}")
}

pub fn folded_key(session: &SessionKey) -> String {
    format!("folded:{session}")
}

pub fn read_json<T>(
    store: &dyn KeyValueStore,
    key: &str,
    stage: &'static str,
) -> StorageResult<Option<T>>
where
    T: DeserializeOwned,
{
    let Some(raw) = store.get(key)? else {
        return Ok(None);
    };

    let value = serde_json::from_str(&raw).context(DecodeValueSnafu {
        stage,
        key: key.to_string(),
    })?;
    Ok(Some(value))
}

pub fn write_json<T>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
    stage: &'static str,
) -> StorageResult<()>
where
    T: Serialize + ?Sized,
{
    let raw = serde_json::to_string(value).context(EncodeValueSnafu {
        stage,
        key: key.to_string(),
    })?;
    store.set(key, &raw)
}
