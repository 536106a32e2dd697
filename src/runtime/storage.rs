use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::domain::config::StorageConfig;

// ---------------------------------------------------------------------------
// Device-local persisted state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StorageKey {
    SessionId,
    DisplayName,
    CurrentLobbyId,
    CurrentTripId,
}

impl StorageKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKey::SessionId => "session_id",
            StorageKey::DisplayName => "display_name",
            StorageKey::CurrentLobbyId => "current_lobby_id",
            StorageKey::CurrentTripId => "current_trip_id",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("local storage unavailable at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode local storage: {0}")]
    Encode(#[from] serde_json::Error),
}

/// String key/value storage that survives restarts of the host application.
pub trait LocalStorage: Send + Sync {
    fn get(&self, key: StorageKey) -> Result<Option<String>, StorageError>;
    fn set(&self, key: StorageKey, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: StorageKey) -> Result<(), StorageError>;
}

pub fn create_storage(config: &StorageConfig) -> Arc<dyn LocalStorage> {
    match config {
        StorageConfig::Memory => Arc::new(MemoryStorage::default()),
        StorageConfig::File { path } => Arc::new(FileStorage::new(path)),
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStorage {
    values: Mutex<BTreeMap<StorageKey, String>>,
}

impl LocalStorage for MemoryStorage {
    fn get(&self, key: StorageKey) -> Result<Option<String>, StorageError> {
        Ok(self
            .values
            .lock()
            .expect("storage lock poisoned")
            .get(&key)
            .cloned())
    }

    fn set(&self, key: StorageKey, value: &str) -> Result<(), StorageError> {
        self.values
            .lock()
            .expect("storage lock poisoned")
            .insert(key, value.to_string());
        Ok(())
    }

    fn remove(&self, key: StorageKey) -> Result<(), StorageError> {
        self.values
            .lock()
            .expect("storage lock poisoned")
            .remove(&key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON file
// ---------------------------------------------------------------------------

/// A single JSON object on disk. A missing or corrupt file reads as empty.
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl AsRef<Path>) -> Self {
        FileStorage {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn io_error(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn read(&self) -> Result<BTreeMap<String, String>, StorageError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(self.io_error(e)),
        };
        match serde_json::from_str(&raw) {
            Ok(values) => Ok(values),
            Err(error) => {
                warn!(path = %self.path.display(), %error, "corrupt local storage; starting empty");
                Ok(BTreeMap::new())
            }
        }
    }

    fn write(&self, values: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let raw = serde_json::to_string_pretty(values)?;
        std::fs::write(&self.path, raw).map_err(|e| self.io_error(e))
    }

    fn modify(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, String>),
    ) -> Result<(), StorageError> {
        let _guard = self.lock.lock().expect("storage lock poisoned");
        let mut values = self.read()?;
        f(&mut values);
        self.write(&values)
    }
}

impl LocalStorage for FileStorage {
    fn get(&self, key: StorageKey) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().expect("storage lock poisoned");
        Ok(self.read()?.remove(key.as_str()))
    }

    fn set(&self, key: StorageKey, value: &str) -> Result<(), StorageError> {
        self.modify(|values| {
            values.insert(key.as_str().to_string(), value.to_string());
        })
    }

    fn remove(&self, key: StorageKey) -> Result<(), StorageError> {
        self.modify(|values| {
            values.remove(key.as_str());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_storage_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let storage = FileStorage::new(&path);
        storage.set(StorageKey::SessionId, "abc").unwrap();
        storage.set(StorageKey::CurrentLobbyId, "lobby").unwrap();
        storage.remove(StorageKey::CurrentLobbyId).unwrap();

        let reopened = FileStorage::new(&path);
        assert_eq!(reopened.get(StorageKey::SessionId).unwrap().as_deref(), Some("abc"));
        assert_eq!(reopened.get(StorageKey::CurrentLobbyId).unwrap(), None);
    }

    #[test]
    fn corrupt_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();

        let storage = FileStorage::new(&path);
        assert_eq!(storage.get(StorageKey::DisplayName).unwrap(), None);
        storage.set(StorageKey::DisplayName, "Zen Nomad").unwrap();
        assert_eq!(
            storage.get(StorageKey::DisplayName).unwrap().as_deref(),
            Some("Zen Nomad")
        );
    }

    #[test]
    fn unreadable_location_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be read as a file.
        let storage = FileStorage::new(dir.path());
        assert!(matches!(
            storage.get(StorageKey::SessionId),
            Err(StorageError::Io { .. })
        ));
    }

    #[test]
    fn memory_storage_round_trip() {
        let storage = MemoryStorage::default();
        assert_eq!(storage.get(StorageKey::CurrentTripId).unwrap(), None);
        storage.set(StorageKey::CurrentTripId, "t1").unwrap();
        assert_eq!(storage.get(StorageKey::CurrentTripId).unwrap().as_deref(), Some("t1"));
    }
}
