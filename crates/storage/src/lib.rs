pub mod annotations;
pub mod error;
pub mod id_set;
pub mod ids;
pub mod json_file;
pub mod keys;
pub mod memory;
pub mod sqlite;

pub use annotations::{FolderMap, LocalAnnotationStore, Reaction, ReactionMap, TagMap};
pub use error::{StorageError, StorageResult};
pub use id_set::IdSet;
pub use ids::{MessageId, SessionId, SessionKey, TENTATIVE_PREFIX, TentativeSessionId};
pub use json_file::JsonFileStore;
pub use keys::{SESSIONS_KEY, read_json, write_json};
pub use memory::MemoryStore;
pub use sqlite::SqliteKvStore;

/// Synchronous string key-value persistence.
///
/// A successful `set` or `delete` means the write is durable for the backend
/// in question; callers reload without waiting.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    fn delete(&self, key: &str) -> StorageResult<()>;
}
