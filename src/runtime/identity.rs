use std::sync::Arc;

use tracing::info;

use super::storage::{LocalStorage, StorageError, StorageKey};
use crate::domain::identity::{compose_display_name, generate_participant_id};
use crate::domain::model::Participant;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("display name must not be blank")]
    BlankDisplayName,
}

/// Anonymous per-device identity backed by local storage. No network calls.
pub struct IdentityProvider {
    storage: Arc<dyn LocalStorage>,
}

impl IdentityProvider {
    pub fn new(storage: Arc<dyn LocalStorage>) -> Self {
        IdentityProvider { storage }
    }

    /// Return the stored identity, minting and persisting any missing part.
    ///
    /// Storage failures propagate: continuing with an unpersisted identity
    /// would orphan everything created under it.
    pub fn get_or_create(&self) -> Result<Participant, IdentityError> {
        let id = match self.read(StorageKey::SessionId)? {
            Some(id) => id,
            None => {
                let id = generate_participant_id(&mut rand::rng());
                self.storage.set(StorageKey::SessionId, &id)?;
                info!(participant = %id, "minted participant identity");
                id
            }
        };
        let display_name = match self.read(StorageKey::DisplayName)? {
            Some(name) => name,
            None => {
                let name = compose_display_name(&mut rand::rng());
                self.storage.set(StorageKey::DisplayName, &name)?;
                name
            }
        };
        Ok(Participant { id, display_name })
    }

    pub fn set_display_name(&self, name: &str) -> Result<Participant, IdentityError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(IdentityError::BlankDisplayName);
        }
        self.storage.set(StorageKey::DisplayName, name)?;
        self.get_or_create()
    }

    fn read(&self, key: StorageKey) -> Result<Option<String>, IdentityError> {
        Ok(self
            .storage
            .get(key)?
            .filter(|v| !v.trim().is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::storage::{FileStorage, MemoryStorage};

    #[test]
    fn identity_is_stable_per_device() {
        let storage: Arc<dyn LocalStorage> = Arc::new(MemoryStorage::default());
        let first = IdentityProvider::new(storage.clone()).get_or_create().unwrap();
        let second = IdentityProvider::new(storage).get_or_create().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.id.len(), 16);
    }

    #[test]
    fn blank_stored_values_are_regenerated() {
        let storage: Arc<dyn LocalStorage> = Arc::new(MemoryStorage::default());
        storage.set(StorageKey::SessionId, "   ").unwrap();
        storage.set(StorageKey::DisplayName, "Bold Voyager").unwrap();

        let participant = IdentityProvider::new(storage).get_or_create().unwrap();
        assert_eq!(participant.id.len(), 16);
        assert_eq!(participant.display_name, "Bold Voyager");
    }

    #[test]
    fn set_display_name_keeps_id() {
        let provider = IdentityProvider::new(Arc::new(MemoryStorage::default()));
        let before = provider.get_or_create().unwrap();
        let after = provider.set_display_name("  Ana  ").unwrap();
        assert_eq!(after.id, before.id);
        assert_eq!(after.display_name, "Ana");
        assert!(matches!(
            provider.set_display_name(" "),
            Err(IdentityError::BlankDisplayName)
        ));
    }

    #[test]
    fn storage_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let provider = IdentityProvider::new(Arc::new(FileStorage::new(dir.path())));
        assert!(matches!(
            provider.get_or_create(),
            Err(IdentityError::Storage(_))
        ));
    }
}
