use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use super::{DocumentStorage, Permission, Profile, StoredDocument};
use crate::{QuireError, QuireResult};

/// On-disk form of a document
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentFile {
    owner_id: String,
    permission: Permission,
    text: String,
    #[serde(default)]
    updated_by: Option<String>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

/// Stores documents and profiles as JSON files under a root directory
///
/// Layout: `<root>/documents/<id>.json` and `<root>/profiles/<id>.json`.
/// Writes go to a temporary file first and are renamed into place.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Open (and create if needed) a storage directory
    pub async fn open(root: impl Into<PathBuf>) -> QuireResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("documents")).await?;
        tokio::fs::create_dir_all(root.join("profiles")).await?;

        info!("Opened file storage at {:?}", root);
        Ok(Self { root })
    }

    /// Create a new document with a random UUID as ID
    pub async fn create_document(
        &self,
        owner_id: &str,
        permission: Permission,
        text: &str,
    ) -> QuireResult<String> {
        let id = Uuid::new_v4().to_string();
        let file = DocumentFile {
            owner_id: owner_id.to_string(),
            permission,
            text: text.to_string(),
            updated_by: Some(owner_id.to_string()),
            updated_at: Some(Utc::now()),
        };
        self.write_json(&self.document_path(&id)?, &file).await?;

        info!("Created document '{}' for owner '{}'", id, owner_id);
        Ok(id)
    }

    /// Write a user profile
    pub async fn put_profile(&self, user_id: &str, profile: &Profile) -> QuireResult<()> {
        self.write_json(&self.profile_path(user_id)?, profile).await
    }

    fn document_path(&self, id: &str) -> QuireResult<PathBuf> {
        Ok(self
            .root
            .join("documents")
            .join(format!("{}.json", checked_id(id)?)))
    }

    fn profile_path(&self, id: &str) -> QuireResult<PathBuf> {
        Ok(self
            .root
            .join("profiles")
            .join(format!("{}.json", checked_id(id)?)))
    }

    async fn read_document(&self, id: &str) -> QuireResult<DocumentFile> {
        let path = self.document_path(id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(QuireError::DocumentNotFound { id: id.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> QuireResult<()> {
        let json = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Wrote {:?}", path);
        Ok(())
    }
}

/// IDs become file names, so only allow a conservative character set
fn checked_id(id: &str) -> QuireResult<&str> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(id)
    } else {
        Err(QuireError::Storage(format!("invalid id '{}'", id)))
    }
}

#[async_trait]
impl DocumentStorage for FileStorage {
    async fn get_document(&self, id: &str) -> QuireResult<StoredDocument> {
        let file = self.read_document(id).await?;
        Ok(StoredDocument {
            owner_id: file.owner_id,
            permission: file.permission,
            text: file.text,
        })
    }

    async fn save_document(&self, id: &str, updater_id: &str, text: &str) -> QuireResult<()> {
        let mut file = self.read_document(id).await?;
        file.text = text.to_string();
        file.updated_by = Some(updater_id.to_string());
        file.updated_at = Some(Utc::now());
        self.write_json(&self.document_path(id)?, &file).await
    }

    async fn touch_document_metadata(&self, id: &str, updater_id: &str) -> QuireResult<()> {
        let mut file = self.read_document(id).await?;
        file.updated_by = Some(updater_id.to_string());
        file.updated_at = Some(Utc::now());
        self.write_json(&self.document_path(id)?, &file).await
    }

    async fn get_profile(&self, user_id: &str) -> QuireResult<Profile> {
        let path = self.profile_path(user_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Profile {
                display_name: user_id.to_string(),
                avatar: None,
            }),
            Err(e) => Err(e.into()),
        }
    }
}
