//! Persistence collaborator consumed by document sessions.
//!
//! Sessions only ever load a document once on start, then write the text
//! back; metadata beyond owner and permission lives with whoever implements
//! [`DocumentStorage`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::QuireResult;

#[cfg(feature = "persistence")]
pub mod file;
pub mod memory;

#[cfg(feature = "persistence")]
pub use file::FileStorage;
pub use memory::MemoryStorage;

/// Who besides the owner may open a document
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    #[default]
    Private,
    PublicRead,
    PublicEdit,
}

/// A document as loaded from storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub owner_id: String,
    pub permission: Permission,
    pub text: String,
}

/// Display information for a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub display_name: String,
    pub avatar: Option<String>,
}

/// Storage backend for document text, document metadata and user profiles
#[async_trait]
pub trait DocumentStorage: Send + Sync + 'static {
    /// Load a document; fails with `DocumentNotFound` if it does not exist
    async fn get_document(&self, id: &str) -> QuireResult<StoredDocument>;

    /// Persist the full text of a document
    async fn save_document(&self, id: &str, updater_id: &str, text: &str) -> QuireResult<()>;

    /// Record who last updated a document without changing its text
    async fn touch_document_metadata(&self, id: &str, updater_id: &str) -> QuireResult<()>;

    /// Look up a user's display name and avatar
    async fn get_profile(&self, user_id: &str) -> QuireResult<Profile>;
}
