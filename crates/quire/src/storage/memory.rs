use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

use super::{DocumentStorage, Permission, Profile, StoredDocument};
use crate::{QuireError, QuireResult};

struct MemoryDocument {
    document: StoredDocument,
    updated_by: Option<String>,
    saves: u64,
}

/// Thread-safe in-memory storage
///
/// Useful for embedding and tests. Saves can be made to fail on demand to
/// exercise the fail-stop path of sessions.
#[derive(Default)]
pub struct MemoryStorage {
    documents: DashMap<String, MemoryDocument>,
    profiles: DashMap<String, Profile>,
    fail_saves: AtomicBool,
}

impl MemoryStorage {
    /// Create an empty storage
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a document under the given ID
    pub fn insert_document(&self, id: impl Into<String>, document: StoredDocument) {
        let id = id.into();
        debug!("Inserting document '{}'", id);
        self.documents.insert(
            id,
            MemoryDocument {
                document,
                updated_by: None,
                saves: 0,
            },
        );
    }

    /// Create a new document with a random UUID as ID
    pub fn create_document(
        &self,
        owner_id: impl Into<String>,
        permission: Permission,
        text: impl Into<String>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        info!("Creating new document: {}", id);
        self.insert_document(
            id.clone(),
            StoredDocument {
                owner_id: owner_id.into(),
                permission,
                text: text.into(),
            },
        );
        id
    }

    /// Insert or replace a user profile
    pub fn insert_profile(&self, user_id: impl Into<String>, profile: Profile) {
        self.profiles.insert(user_id.into(), profile);
    }

    /// Current stored state of a document
    pub fn document(&self, id: &str) -> Option<StoredDocument> {
        self.documents.get(id).map(|entry| entry.document.clone())
    }

    /// Number of successful text saves for a document
    pub fn save_count(&self, id: &str) -> u64 {
        self.documents.get(id).map(|entry| entry.saves).unwrap_or(0)
    }

    /// User that last saved or touched a document
    pub fn updated_by(&self, id: &str) -> Option<String> {
        self.documents
            .get(id)
            .and_then(|entry| entry.updated_by.clone())
    }

    /// Make every subsequent save fail (or succeed again)
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Release);
    }

    fn check_writable(&self, id: &str) -> QuireResult<()> {
        if self.fail_saves.load(Ordering::Acquire) {
            return Err(QuireError::Storage(format!(
                "writes to document '{}' are failing",
                id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStorage for MemoryStorage {
    async fn get_document(&self, id: &str) -> QuireResult<StoredDocument> {
        self.document(id)
            .ok_or_else(|| QuireError::DocumentNotFound { id: id.to_string() })
    }

    async fn save_document(&self, id: &str, updater_id: &str, text: &str) -> QuireResult<()> {
        self.check_writable(id)?;
        let mut entry = self
            .documents
            .get_mut(id)
            .ok_or_else(|| QuireError::DocumentNotFound { id: id.to_string() })?;
        entry.document.text = text.to_string();
        entry.updated_by = Some(updater_id.to_string());
        entry.saves += 1;
        Ok(())
    }

    async fn touch_document_metadata(&self, id: &str, updater_id: &str) -> QuireResult<()> {
        self.check_writable(id)?;
        let mut entry = self
            .documents
            .get_mut(id)
            .ok_or_else(|| QuireError::DocumentNotFound { id: id.to_string() })?;
        entry.updated_by = Some(updater_id.to_string());
        Ok(())
    }

    async fn get_profile(&self, user_id: &str) -> QuireResult<Profile> {
        Ok(self
            .profiles
            .get(user_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| Profile {
                display_name: user_id.to_string(),
                avatar: None,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn sample() -> StoredDocument {
        StoredDocument {
            owner_id: "owner".to_string(),
            permission: Permission::PublicEdit,
            text: "hello".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_document_with_uuid() {
        let storage = MemoryStorage::new();
        let id = storage.create_document("owner", Permission::Private, "text");
        assert!(!id.is_empty());
        assert_eq!(storage.get_document(&id).await.unwrap().text, "text");
    }

    #[tokio::test]
    async fn test_save_and_touch() {
        let storage = MemoryStorage::new();
        storage.insert_document("doc", sample());

        assert_ok!(storage.save_document("doc", "alice", "hello world").await);
        assert_eq!(storage.document("doc").unwrap().text, "hello world");
        assert_eq!(storage.save_count("doc"), 1);

        assert_ok!(storage.touch_document_metadata("doc", "bob").await);
        assert_eq!(storage.updated_by("doc").as_deref(), Some("bob"));
        assert_eq!(storage.save_count("doc"), 1);
    }

    #[tokio::test]
    async fn test_missing_document() {
        let storage = MemoryStorage::new();
        assert!(matches!(
            storage.get_document("missing").await,
            Err(QuireError::DocumentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_failing_saves() {
        let storage = MemoryStorage::new();
        storage.insert_document("doc", sample());
        storage.set_fail_saves(true);

        assert!(matches!(
            storage.save_document("doc", "alice", "x").await,
            Err(QuireError::Storage(_))
        ));
        assert_eq!(storage.document("doc").unwrap().text, "hello");
    }

    #[tokio::test]
    async fn test_profile_falls_back_to_user_id() {
        let storage = MemoryStorage::new();
        storage.insert_profile(
            "alice",
            Profile {
                display_name: "Alice".to_string(),
                avatar: Some("alice.png".to_string()),
            },
        );

        assert_eq!(storage.get_profile("alice").await.unwrap().display_name, "Alice");
        assert_eq!(storage.get_profile("bob").await.unwrap().display_name, "bob");
    }
}
