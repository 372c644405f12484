use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use snafu::ResultExt;

use super::KeyValueStore;
use super::error::{
    CreateDirectorySnafu, DecodeValueSnafu, EncodeValueSnafu, InvariantViolationSnafu,
    ReadFileSnafu, RenameTempFileSnafu, StorageResult, WriteFileSnafu,
};

/// Key-value store kept as one JSON object on disk.
///
/// The whole file is rewritten on every mutation through a temporary file and
/// a rename, so a crash leaves either the old or the new contents.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path).context(ReadFileSnafu {
                stage: "json-store-read",
                path: path.clone(),
            })?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content).context(DecodeValueSnafu {
                    stage: "json-store-decode",
                    key: path.display().to_string(),
                })?
            }
        } else {
            BTreeMap::new()
        };

        tracing::debug!(path = %path.display(), entries = entries.len(), "opened json store");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self, stage: &'static str) -> StorageResult<MutexGuard<'_, BTreeMap<String, String>>> {
        match self.entries.lock() {
            Ok(guard) => Ok(guard),
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "json store lock poisoned".to_string(),
            }
            .fail(),
        }
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> StorageResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirectorySnafu {
                stage: "json-store-create-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(entries).context(EncodeValueSnafu {
            stage: "json-store-encode",
            key: self.path.display().to_string(),
        })?;

        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "json-store-write-temporary",
            path: temp_path.clone(),
        })?;
        std::fs::rename(&temp_path, &self.path).context(RenameTempFileSnafu {
            stage: "json-store-rename-temporary",
            from: temp_path,
            to: self.path.clone(),
        })?;

        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.lock("json-store-get")?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut entries = self.lock("json-store-set")?;
        let previous = entries.insert(key.to_string(), value.to_string());
        if let Err(error) = self.persist(&entries) {
            // Keep memory and disk in agreement when the write fails.
            match previous {
                Some(previous) => entries.insert(key.to_string(), previous),
                None => entries.remove(key),
            };
            return Err(error);
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        let mut entries = self.lock("json-store-delete")?;
        let Some(previous) = entries.remove(key) else {
            return Ok(());
        };
        if let Err(error) = self.persist(&entries) {
            entries.insert(key.to_string(), previous);
            return Err(error);
        }
        Ok(())
    }
}
