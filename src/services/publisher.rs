use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::error::ApiError;
use crate::entities::{files, watchlist};
use crate::models::{FileInfo, WatchlistMode};
use crate::services::identity::Identity;
use crate::services::stash::StashedFile;
use crate::services::storage::StorageService;

/// Bytes to publish: a spooled request file or a complete stash entry.
#[derive(Debug, Clone, Copy)]
pub enum PublishContent<'a> {
    Path(&'a Path),
    Stashed(&'a StashedFile),
}

/// Everything about a publish besides the bytes.
#[derive(Debug, Clone, Default)]
pub struct PublishRequest {
    pub name: String,
    pub comment: String,
    /// Description for a new file, defaults to the comment
    pub text: Option<String>,
    pub tags: Vec<String>,
    pub watch: bool,
    pub mime_type: Option<String>,
}

/// Whether publishing should add the file to the uploader's watchlist.
pub fn resolve_watch(mode: WatchlistMode, deprecated_watch: bool, identity: &Identity) -> bool {
    if deprecated_watch {
        return true;
    }
    match mode {
        WatchlistMode::Watch => true,
        WatchlistMode::Preferences => identity.watch_uploads,
        WatchlistMode::NoChange => false,
    }
}

/// Object key of one published version of `name`. Name-hashed directories keep listings small.
pub fn public_key(name: &str, version: &str) -> String {
    let hash = hex::encode(Sha256::digest(name.as_bytes()));
    format!("public/{}/{}/{}/{}", &hash[..1], &hash[..2], version, name)
}

/// Commits uploads as published files.
#[derive(Clone)]
pub struct Publisher {
    db: DatabaseConnection,
    storage: Arc<dyn StorageService>,
}

impl Publisher {
    pub fn new(db: DatabaseConnection, storage: Arc<dyn StorageService>) -> Self {
        Self { db, storage }
    }

    pub async fn publish(
        &self,
        identity: &Identity,
        request: &PublishRequest,
        content: PublishContent<'_>,
    ) -> Result<FileInfo, ApiError> {
        let uploader = identity.owner().ok_or_else(|| {
            ApiError::permission("mustbeloggedin", "You must be logged in to upload this file")
        })?;
        let key = public_key(&request.name, &uuid::Uuid::new_v4().simple().to_string());

        let (size, sha256) = match content {
            PublishContent::Path(path) => {
                let file = tokio::fs::File::open(path).await.map_err(|e| {
                    ApiError::internal(format!("Failed to open upload {}: {}", path.display(), e))
                })?;
                let stored = self
                    .storage
                    .upload_stream_with_hash(&key, Box::new(file))
                    .await
                    .map_err(|e| ApiError::internal(format!("Failed to store file: {}", e)))?;
                (stored.size.max(0) as u64, stored.sha256)
            }
            PublishContent::Stashed(stashed) => {
                let sha256 = match &stashed.sha256 {
                    Some(sha) => sha.clone(),
                    None => {
                        let data = self.storage.get_file(&stashed.storage_key).await.map_err(
                            |e| ApiError::internal(format!("Failed to read stashed file: {}", e)),
                        )?;
                        hex::encode(Sha256::digest(&data))
                    }
                };
                self.storage
                    .copy_object(&stashed.storage_key, &key)
                    .await
                    .map_err(|e| ApiError::internal(format!("Failed to store file: {}", e)))?;
                (stashed.size, sha256)
            }
        };

        let now = Utc::now();
        let previous = match self
            .record(uploader, request, &key, size, &sha256, now)
            .await
        {
            Ok(previous) => previous,
            Err(e) => {
                if let Err(cleanup) = self.storage.delete_file(&key).await {
                    warn!(key = %key, "Failed to remove unrecorded object: {}", cleanup);
                }
                return Err(e);
            }
        };

        // The row points at the new version now
        if let Some(old_key) = previous {
            if let Err(e) = self.storage.delete_file(&old_key).await {
                warn!(key = %old_key, "Failed to remove replaced version: {}", e);
            }
        }

        if request.watch {
            self.watch(uploader, &request.name).await?;
        }

        Ok(FileInfo {
            name: request.name.clone(),
            size,
            sha256,
            mime_type: request.mime_type.clone(),
            timestamp: now,
        })
    }

    /// Creates or updates the `files` row. Returns the storage key of the replaced version.
    async fn record(
        &self,
        uploader: &str,
        request: &PublishRequest,
        key: &str,
        size: u64,
        sha256: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, ApiError> {
        match files::Entity::find_by_id(request.name.as_str())
            .one(&self.db)
            .await?
        {
            Some(existing) => {
                let old_key = existing.storage_key.clone();
                let mut active: files::ActiveModel = existing.into();
                active.storage_key = Set(key.to_string());
                active.size = Set(size as i64);
                active.sha256 = Set(sha256.to_string());
                active.mime_type = Set(request.mime_type.clone());
                active.uploader_id = Set(uploader.to_string());
                active.comment = Set(request.comment.clone());
                active.tags = Set(json!(request.tags));
                active.updated_at = Set(now);
                active.update(&self.db).await?;
                info!(name = %request.name, user_id = %uploader, size, "Published new version of file");
                Ok(Some(old_key))
            }
            None => {
                files::ActiveModel {
                    name: Set(request.name.clone()),
                    storage_key: Set(key.to_string()),
                    size: Set(size as i64),
                    sha256: Set(sha256.to_string()),
                    mime_type: Set(request.mime_type.clone()),
                    uploader_id: Set(uploader.to_string()),
                    comment: Set(request.comment.clone()),
                    description: Set(request
                        .text
                        .clone()
                        .unwrap_or_else(|| request.comment.clone())),
                    tags: Set(json!(request.tags)),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&self.db)
                .await?;
                info!(name = %request.name, user_id = %uploader, size, "Published file");
                Ok(None)
            }
        }
    }

    async fn watch(&self, user_id: &str, title: &str) -> Result<(), ApiError> {
        let watched = watchlist::Entity::find()
            .filter(watchlist::Column::UserId.eq(user_id))
            .filter(watchlist::Column::Title.eq(title))
            .one(&self.db)
            .await?;
        if watched.is_none() {
            watchlist::ActiveModel {
                id: Set(uuid::Uuid::new_v4().to_string()),
                user_id: Set(user_id.to_string()),
                title: Set(title.to_string()),
                created_at: Set(Utc::now()),
            }
            .insert(&self.db)
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::run_migrations;
    use crate::services::stash::UploadStash;
    use crate::services::storage::LocalStorageService;
    use bytes::Bytes;
    use sea_orm::{Database, PaginatorTrait};
    use std::io::Write;

    fn uploader() -> Identity {
        Identity {
            user_id: Some("u1".to_string()),
            username: Some("Uploader".to_string()),
            rights: vec!["upload".to_string()],
            ..Identity::default()
        }
    }

    async fn setup() -> (Publisher, UploadStash, DatabaseConnection, tempfile::TempDir) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageService> = Arc::new(LocalStorageService::new(dir.path()));
        let stash = UploadStash::new(db.clone(), storage.clone(), 48);
        (Publisher::new(db.clone(), storage), stash, db, dir)
    }

    #[test]
    fn test_watch_resolution() {
        let mut identity = uploader();
        assert!(resolve_watch(WatchlistMode::Watch, false, &identity));
        assert!(!resolve_watch(WatchlistMode::NoChange, false, &identity));
        assert!(resolve_watch(WatchlistMode::NoChange, true, &identity));
        assert!(!resolve_watch(WatchlistMode::Preferences, false, &identity));
        identity.watch_uploads = true;
        assert!(resolve_watch(WatchlistMode::Preferences, false, &identity));
    }

    #[test]
    fn test_public_key_layout() {
        let key = public_key("Example.png", "v1");
        assert!(key.starts_with("public/"));
        assert!(key.ends_with("/v1/Example.png"));
        let parts: Vec<&str> = key.split('/').collect();
        assert_eq!(parts.len(), 5);
        assert!(parts[2].starts_with(parts[1]));

        let other = public_key("Example.png", "v2");
        assert_eq!(key.rsplitn(3, '/').last(), other.rsplitn(3, '/').last());
    }

    #[tokio::test]
    async fn test_publish_from_path_and_watch() {
        let (publisher, _stash, db, _dir) = setup().await;
        let mut temp = tempfile::NamedTempFile::new().unwrap();
        temp.write_all(b"plain text body").unwrap();

        let request = PublishRequest {
            name: "Notes.png".to_string(),
            comment: "first".to_string(),
            watch: true,
            ..PublishRequest::default()
        };
        let info = publisher
            .publish(&uploader(), &request, PublishContent::Path(temp.path()))
            .await
            .unwrap();
        assert_eq!(info.size, 15);
        assert_eq!(info.sha256, hex::encode(Sha256::digest(b"plain text body")));

        let row = files::Entity::find_by_id("Notes.png").one(&db).await.unwrap().unwrap();
        assert_eq!(row.description, "first");
        assert_eq!(watchlist::Entity::find().count(&db).await.unwrap(), 1);

        // Publishing again keeps a single watchlist row and updates the file
        let request = PublishRequest {
            comment: "second".to_string(),
            ..request
        };
        publisher
            .publish(&uploader(), &request, PublishContent::Path(temp.path()))
            .await
            .unwrap();
        let row = files::Entity::find_by_id("Notes.png").one(&db).await.unwrap().unwrap();
        assert_eq!(row.comment, "second");
        assert_eq!(row.description, "first");
        assert_eq!(watchlist::Entity::find().count(&db).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_new_version_replaces_old_object() {
        let (publisher, stash, db, _dir) = setup().await;
        let mut temp = tempfile::NamedTempFile::new().unwrap();
        temp.write_all(b"version one").unwrap();
        let request = PublishRequest {
            name: "Versioned.png".to_string(),
            ..PublishRequest::default()
        };

        publisher
            .publish(&uploader(), &request, PublishContent::Path(temp.path()))
            .await
            .unwrap();
        let first = files::Entity::find_by_id("Versioned.png").one(&db).await.unwrap().unwrap();

        let mut temp = tempfile::NamedTempFile::new().unwrap();
        temp.write_all(b"version two").unwrap();
        publisher
            .publish(&uploader(), &request, PublishContent::Path(temp.path()))
            .await
            .unwrap();
        let second = files::Entity::find_by_id("Versioned.png").one(&db).await.unwrap().unwrap();

        assert_ne!(first.storage_key, second.storage_key);
        assert!(!stash.storage().file_exists(&first.storage_key).await.unwrap());
        assert_eq!(
            stash.storage().get_file(&second.storage_key).await.unwrap(),
            b"version two"
        );
    }

    #[tokio::test]
    async fn test_publish_from_stash() {
        let (publisher, stash, db, _dir) = setup().await;
        let stashed = stash
            .stash_bytes(Some("u1"), Bytes::from_static(b"stashed body"), "S.png", false)
            .await
            .unwrap();

        let request = PublishRequest {
            name: "S.png".to_string(),
            text: Some("Description".to_string()),
            ..PublishRequest::default()
        };
        let info = publisher
            .publish(&uploader(), &request, PublishContent::Stashed(&stashed))
            .await
            .unwrap();
        assert_eq!(info.size, 12);
        assert_eq!(Some(info.sha256), stashed.sha256);

        let row = files::Entity::find_by_id("S.png").one(&db).await.unwrap().unwrap();
        assert_eq!(row.description, "Description");
    }

    #[tokio::test]
    async fn test_anonymous_cannot_publish() {
        let (publisher, _stash, _db, _dir) = setup().await;
        let temp = tempfile::NamedTempFile::new().unwrap();
        let err = publisher
            .publish(
                &Identity::anonymous(),
                &PublishRequest::default(),
                PublishContent::Path(temp.path()),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "mustbeloggedin");
    }
}
