use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::KeyValueStore;
use super::error::{InvariantViolationSnafu, StorageResult};

/// Process-local store used by tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.lock("memory-keys")?.keys().cloned().collect())
    }

    fn lock(&self, stage: &'static str) -> StorageResult<MutexGuard<'_, BTreeMap<String, String>>> {
        match self.entries.lock() {
            Ok(guard) => Ok(guard),
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "memory store lock poisoned".to_string(),
            }
            .fail(),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.lock("memory-get")?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.lock("memory-set")?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.lock("memory-delete")?.remove(key);
        Ok(())
    }
}
