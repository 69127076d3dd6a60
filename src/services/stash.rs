use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set,
};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tracing::{info, warn};

use crate::entities::{upload_sessions, upload_stash};
use crate::models::{SessionStatus, UploadResult, UploadSession, UploadStage};
use crate::services::storage::StorageService;
use crate::utils::validation::{generate_file_key, is_valid_file_key};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StashError {
    #[error("Could not find the stashed file {0}")]
    NotFound(String),

    #[error("Invalid stash key: {0}")]
    BadKey(String),

    #[error("Could not store upload in the stash: {0}")]
    Storage(String),

    #[error("File is of zero length, and could not be stored in the stash")]
    ZeroLength,

    #[error("Not logged in: You must be logged in to save to the upload stash")]
    NotLoggedIn,

    #[error("The file {file_key} you are trying to access is not owned by you")]
    WrongOwner { file_key: String },

    #[error("No such filekey: {0}")]
    NoSuchKey(String),

    #[error("{type_name}: {message}")]
    Other { type_name: String, message: String },
}

impl StashError {
    pub fn code(&self) -> &'static str {
        match self {
            StashError::NotFound(_) => "stashedfilenotfound",
            StashError::BadKey(_) => "stashpathinvalid",
            StashError::Storage(_) => "stashfilestorage",
            StashError::ZeroLength => "stashzerolength",
            StashError::NotLoggedIn => "stashnotloggedin",
            StashError::WrongOwner { .. } => "stashwrongowner",
            StashError::NoSuchKey(_) => "stashnosuchfilekey",
            StashError::Other { .. } => "stasherror",
        }
    }

    fn other(type_name: &str, message: impl Into<String>) -> Self {
        StashError::Other {
            type_name: type_name.to_string(),
            message: message.into(),
        }
    }
}

impl From<DbErr> for StashError {
    fn from(err: DbErr) -> Self {
        StashError::other("DbErr", err.to_string())
    }
}

/// A stash entry as seen by the rest of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct StashedFile {
    pub file_key: String,
    pub user_id: String,
    pub storage_key: String,
    pub original_name: String,
    pub size: u64,
    pub sha256: Option<String>,
    pub mime_type: Option<String>,
    pub is_partial: bool,
    pub chunk_count: u32,
    pub created_at: DateTime<Utc>,
}

impl StashedFile {
    pub fn chunk_key(&self, index: u32) -> String {
        format!("{}.{}", self.storage_key, index)
    }

    /// Every storage object backing this entry.
    pub fn object_keys(&self) -> Vec<String> {
        if self.is_partial {
            (0..self.chunk_count).map(|i| self.chunk_key(i)).collect()
        } else {
            vec![self.storage_key.clone()]
        }
    }
}

impl From<upload_stash::Model> for StashedFile {
    fn from(model: upload_stash::Model) -> Self {
        Self {
            file_key: model.file_key,
            user_id: model.user_id,
            storage_key: model.storage_key,
            original_name: model.original_name,
            size: model.size.max(0) as u64,
            sha256: model.sha256,
            mime_type: model.mime_type,
            is_partial: model.is_partial,
            chunk_count: model.chunk_count.max(0) as u32,
            created_at: model.created_at,
        }
    }
}

/// Per-user temporary storage for unpublished uploads and their session state.
#[derive(Clone)]
pub struct UploadStash {
    db: DatabaseConnection,
    storage: Arc<dyn StorageService>,
    expiry: Duration,
}

fn require_owner(owner: Option<&str>) -> Result<&str, StashError> {
    owner.ok_or(StashError::NotLoggedIn)
}

impl UploadStash {
    pub fn new(db: DatabaseConnection, storage: Arc<dyn StorageService>, expiry_hours: u64) -> Self {
        Self {
            db,
            storage,
            expiry: Duration::hours(expiry_hours as i64),
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageService> {
        &self.storage
    }

    /// Stashes a complete file from local disk under a fresh key.
    pub async fn stash_file(
        &self,
        owner: Option<&str>,
        path: &Path,
        original_name: &str,
    ) -> Result<StashedFile, StashError> {
        let owner = require_owner(owner)?;
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| StashError::NotFound(format!("{}: {}", path.display(), e)))?;
        if metadata.len() == 0 {
            return Err(StashError::ZeroLength);
        }

        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| StashError::NotFound(format!("{}: {}", path.display(), e)))?;

        let file_key = generate_file_key(original_name);
        let storage_key = format!("stash/{}/{}", owner, file_key);
        let stored = self
            .storage
            .upload_stream_with_hash(&storage_key, Box::new(file))
            .await
            .map_err(|e| StashError::Storage(e.to_string()))?;

        self.insert_entry(owner, &file_key, &storage_key, original_name, stored.size, Some(stored.sha256), false, 0)
            .await
    }

    /// Stashes in-memory bytes. A partial entry starts a chunk set with these bytes as chunk 0.
    pub async fn stash_bytes(
        &self,
        owner: Option<&str>,
        data: Bytes,
        original_name: &str,
        is_partial: bool,
    ) -> Result<StashedFile, StashError> {
        let owner = require_owner(owner)?;
        if data.is_empty() {
            return Err(StashError::ZeroLength);
        }

        let file_key = generate_file_key(original_name);
        let storage_key = format!("stash/{}/{}", owner, file_key);
        let size = data.len() as i64;

        if is_partial {
            self.storage
                .upload_file(&format!("{}.0", storage_key), data.to_vec())
                .await
                .map_err(|e| StashError::Storage(e.to_string()))?;
            self.insert_entry(owner, &file_key, &storage_key, original_name, size, None, true, 1)
                .await
        } else {
            let sha256 = hex::encode(Sha256::digest(&data));
            self.storage
                .upload_file(&storage_key, data.to_vec())
                .await
                .map_err(|e| StashError::Storage(e.to_string()))?;
            self.insert_entry(owner, &file_key, &storage_key, original_name, size, Some(sha256), false, 0)
                .await
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_entry(
        &self,
        owner: &str,
        file_key: &str,
        storage_key: &str,
        original_name: &str,
        size: i64,
        sha256: Option<String>,
        is_partial: bool,
        chunk_count: i32,
    ) -> Result<StashedFile, StashError> {
        let now = Utc::now();
        let model = upload_stash::ActiveModel {
            file_key: Set(file_key.to_string()),
            user_id: Set(owner.to_string()),
            storage_key: Set(storage_key.to_string()),
            original_name: Set(original_name.to_string()),
            size: Set(size),
            sha256: Set(sha256),
            mime_type: Set(None),
            is_partial: Set(is_partial),
            chunk_count: Set(chunk_count),
            created_at: Set(now),
            expires_at: Set(now + self.expiry),
        }
        .insert(&self.db)
        .await?;

        info!(file_key = %file_key, user_id = %owner, size, is_partial, "Stashed upload");
        Ok(model.into())
    }

    /// Adds the next chunk to a partial entry.
    pub async fn append_chunk(
        &self,
        owner: Option<&str>,
        file_key: &str,
        data: Bytes,
    ) -> Result<StashedFile, StashError> {
        if data.is_empty() {
            return Err(StashError::ZeroLength);
        }
        let file = self.get_file(owner, file_key).await?;
        if !file.is_partial {
            return Err(StashError::other(
                "StashNotPartial",
                format!("{} is not receiving chunks", file_key),
            ));
        }

        self.storage
            .upload_file(&file.chunk_key(file.chunk_count), data.to_vec())
            .await
            .map_err(|e| StashError::Storage(e.to_string()))?;

        let new_size = file.size + data.len() as u64;
        let mut active: upload_stash::ActiveModel = upload_stash::Entity::find_by_id(file_key)
            .one(&self.db)
            .await?
            .ok_or_else(|| StashError::NoSuchKey(file_key.to_string()))?
            .into();
        active.size = Set(new_size as i64);
        active.chunk_count = Set(file.chunk_count as i32 + 1);
        let model = active.update(&self.db).await?;

        Ok(model.into())
    }

    /// Streams all chunks of a partial entry, in order, into a new complete entry.
    /// The partial entry is left in place for the caller to remove.
    pub async fn concatenate_chunks(
        &self,
        owner: Option<&str>,
        file_key: &str,
    ) -> Result<StashedFile, StashError> {
        let file = self.get_file(owner, file_key).await?;
        if !file.is_partial {
            return Err(StashError::other(
                "StashNotPartial",
                format!("{} has no chunks to assemble", file_key),
            ));
        }

        let new_key = generate_file_key(&file.original_name);
        let storage_key = format!("stash/{}/{}", file.user_id, new_key);

        let storage = self.storage.clone();
        let chunks = futures::stream::iter(file.object_keys()).then(move |key| {
            let storage = storage.clone();
            async move {
                storage
                    .get_file(&key)
                    .await
                    .map(Bytes::from)
                    .map_err(|e| std::io::Error::other(format!("{}: {}", key, e)))
            }
        });
        let reader = StreamReader::new(Box::pin(chunks));

        let stored = self
            .storage
            .upload_stream_with_hash(&storage_key, Box::new(reader))
            .await
            .map_err(|e| StashError::Storage(e.to_string()))?;

        if stored.size as u64 != file.size {
            if let Err(e) = self.storage.delete_file(&storage_key).await {
                warn!(storage_key = %storage_key, "Failed to remove short assembly: {}", e);
            }
            return Err(StashError::Storage(format!(
                "assembled {} bytes, expected {}",
                stored.size, file.size
            )));
        }

        info!(file_key = %file_key, new_key = %new_key, chunks = file.chunk_count, "Concatenated chunks");
        self.insert_entry(
            &file.user_id,
            &new_key,
            &storage_key,
            &file.original_name,
            stored.size,
            Some(stored.sha256),
            false,
            0,
        )
        .await
    }

    pub async fn get_file(
        &self,
        owner: Option<&str>,
        file_key: &str,
    ) -> Result<StashedFile, StashError> {
        let owner = require_owner(owner)?;
        if !is_valid_file_key(file_key) {
            return Err(StashError::BadKey(file_key.to_string()));
        }

        let model = upload_stash::Entity::find_by_id(file_key)
            .one(&self.db)
            .await?
            .ok_or_else(|| StashError::NoSuchKey(file_key.to_string()))?;

        if model.user_id != owner {
            return Err(StashError::WrongOwner {
                file_key: file_key.to_string(),
            });
        }

        if !model.is_partial {
            let exists = self
                .storage
                .file_exists(&model.storage_key)
                .await
                .map_err(|e| StashError::Storage(e.to_string()))?;
            if !exists {
                return Err(StashError::NotFound(file_key.to_string()));
            }
        }

        Ok(model.into())
    }

    pub async fn read_file(&self, file: &StashedFile) -> Result<Vec<u8>, StashError> {
        self.storage
            .get_file(&file.storage_key)
            .await
            .map_err(|e| StashError::NotFound(format!("{}: {}", file.file_key, e)))
    }

    /// Streams a complete entry into a local temporary file for verification.
    pub async fn download_to_temp(&self, file: &StashedFile) -> Result<NamedTempFile, StashError> {
        let mut reader = self
            .storage
            .get_object_stream(&file.storage_key)
            .await
            .map_err(|e| StashError::NotFound(format!("{}: {}", file.file_key, e)))?;
        let temp = NamedTempFile::new().map_err(|e| StashError::other("IoError", e.to_string()))?;
        let mut out = tokio::fs::File::create(temp.path())
            .await
            .map_err(|e| StashError::other("IoError", e.to_string()))?;
        tokio::io::copy(&mut reader, &mut out)
            .await
            .map_err(|e| StashError::other("IoError", e.to_string()))?;
        out.flush()
            .await
            .map_err(|e| StashError::other("IoError", e.to_string()))?;
        Ok(temp)
    }

    /// Deletes an entry and its objects. Removing a missing entry succeeds.
    pub async fn remove_file(&self, owner: Option<&str>, file_key: &str) -> Result<(), StashError> {
        let owner = require_owner(owner)?;
        let Some(model) = upload_stash::Entity::find_by_id(file_key).one(&self.db).await? else {
            return Ok(());
        };
        if model.user_id != owner {
            return Err(StashError::WrongOwner {
                file_key: file_key.to_string(),
            });
        }
        self.purge(model.into()).await
    }

    async fn purge(&self, file: StashedFile) -> Result<(), StashError> {
        for key in file.object_keys() {
            self.storage
                .delete_file(&key)
                .await
                .map_err(|e| StashError::Storage(e.to_string()))?;
        }
        upload_stash::Entity::delete_by_id(file.file_key.clone())
            .exec(&self.db)
            .await?;
        info!(file_key = %file.file_key, "Removed stash entry");
        Ok(())
    }

    /// Drops stash entries past their expiry and sessions idle for as long. Returns entries removed.
    pub async fn remove_expired(&self) -> Result<usize, StashError> {
        let now = Utc::now();
        let expired = upload_stash::Entity::find()
            .filter(upload_stash::Column::ExpiresAt.lt(now))
            .all(&self.db)
            .await?;

        let mut removed = 0;
        for model in expired {
            let file_key = model.file_key.clone();
            match self.purge(model.into()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(file_key = %file_key, "Failed to remove expired stash entry: {}", e),
            }
        }

        upload_sessions::Entity::delete_many()
            .filter(upload_sessions::Column::UpdatedAt.lt(now - self.expiry))
            .exec(&self.db)
            .await?;

        Ok(removed)
    }

    pub async fn get_session_status(
        &self,
        owner: Option<&str>,
        file_key: &str,
    ) -> Result<Option<UploadSession>, StashError> {
        let owner = require_owner(owner)?;
        let Some(model) = upload_sessions::Entity::find_by_id(file_key)
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };
        if model.user_id != owner {
            return Err(StashError::WrongOwner {
                file_key: file_key.to_string(),
            });
        }
        session_from_model(model).map(Some)
    }

    /// Persists (or with `None`, clears) the session of `file_key`.
    ///
    /// A session that reached `Success` or `Failure` only accepts an identical
    /// write, and the received offset never moves backwards. A rejected write
    /// returns `Ok(false)` and leaves the stored session untouched.
    pub async fn set_session_status(
        &self,
        owner: Option<&str>,
        file_key: &str,
        session: Option<&UploadSession>,
    ) -> Result<bool, StashError> {
        let owner = require_owner(owner)?;
        let existing = upload_sessions::Entity::find_by_id(file_key)
            .one(&self.db)
            .await?;
        if let Some(model) = &existing {
            if model.user_id != owner {
                return Err(StashError::WrongOwner {
                    file_key: file_key.to_string(),
                });
            }
        }

        let Some(session) = session else {
            if existing.is_some() {
                upload_sessions::Entity::delete_by_id(file_key)
                    .exec(&self.db)
                    .await?;
                info!(file_key = %file_key, "Cleared upload session");
            }
            return Ok(true);
        };

        if let Some(size) = session.file_size {
            if session.offset > size {
                warn!(file_key = %file_key, offset = session.offset, size, "Rejected session offset past the declared size");
                return Ok(false);
            }
        }

        let status = serde_json::to_value(&session.status)
            .map_err(|e| StashError::other("SerdeError", e.to_string()))?;
        let now = Utc::now();

        match existing {
            Some(model) => {
                let current = session_from_model(model.clone())?;
                if current.result.is_terminal() && !same_state(&current, session) {
                    warn!(file_key = %file_key, result = %current.result, "Ignored write to a finished session");
                    return Ok(false);
                }
                if session.offset < current.offset {
                    warn!(file_key = %file_key, stored = current.offset, offset = session.offset, "Ignored session write moving the offset backwards");
                    return Ok(false);
                }

                let mut active: upload_sessions::ActiveModel = model.into();
                active.stage = Set(session.stage.to_string());
                active.result = Set(session.result.to_string());
                active.offset_received = Set(session.offset as i64);
                active.file_size = Set(session.file_size.map(|s| s as i64));
                active.status = Set(status);
                active.updated_at = Set(now);
                active.update(&self.db).await?;
            }
            None => {
                upload_sessions::ActiveModel {
                    file_key: Set(file_key.to_string()),
                    user_id: Set(owner.to_string()),
                    stage: Set(session.stage.to_string()),
                    result: Set(session.result.to_string()),
                    offset_received: Set(session.offset as i64),
                    file_size: Set(session.file_size.map(|s| s as i64)),
                    status: Set(status),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&self.db)
                .await?;
            }
        }

        info!(
            file_key = %file_key,
            result = %session.result,
            stage = %session.stage,
            offset = session.offset,
            "Upload session updated"
        );
        Ok(true)
    }
}

fn same_state(a: &UploadSession, b: &UploadSession) -> bool {
    a.result == b.result
        && a.stage == b.stage
        && a.offset == b.offset
        && a.file_size == b.file_size
        && a.status == b.status
}

fn session_from_model(model: upload_sessions::Model) -> Result<UploadSession, StashError> {
    let result: UploadResult = model
        .result
        .parse()
        .map_err(|e: String| StashError::other("CorruptSession", e))?;
    let stage: UploadStage = model
        .stage
        .parse()
        .map_err(|e: String| StashError::other("CorruptSession", e))?;
    let status: SessionStatus = serde_json::from_value(model.status)
        .map_err(|e| StashError::other("CorruptSession", e.to_string()))?;

    Ok(UploadSession {
        file_key: model.file_key,
        user_id: model.user_id,
        result,
        stage,
        offset: model.offset_received.max(0) as u64,
        file_size: model.file_size.map(|s| s.max(0) as u64),
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::run_migrations;
    use crate::services::storage::LocalStorageService;
    use sea_orm::Database;
    use tempfile::TempDir;

    async fn setup() -> (UploadStash, TempDir) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageService> = Arc::new(LocalStorageService::new(dir.path()));
        (UploadStash::new(db, storage, 48), dir)
    }

    #[tokio::test]
    async fn test_zero_length_is_rejected() {
        let (stash, _dir) = setup().await;
        let err = stash
            .stash_bytes(Some("u1"), Bytes::new(), "a.png", false)
            .await
            .unwrap_err();
        assert_eq!(err, StashError::ZeroLength);
    }

    #[tokio::test]
    async fn test_anonymous_cannot_stash() {
        let (stash, _dir) = setup().await;
        let err = stash
            .stash_bytes(None, Bytes::from_static(b"data"), "a.png", false)
            .await
            .unwrap_err();
        assert_eq!(err, StashError::NotLoggedIn);
    }

    #[tokio::test]
    async fn test_owner_is_enforced() {
        let (stash, _dir) = setup().await;
        let file = stash
            .stash_bytes(Some("u1"), Bytes::from_static(b"data"), "a.png", false)
            .await
            .unwrap();

        let err = stash.get_file(Some("u2"), &file.file_key).await.unwrap_err();
        assert_eq!(err.code(), "stashwrongowner");

        let err = stash.remove_file(Some("u2"), &file.file_key).await.unwrap_err();
        assert_eq!(err.code(), "stashwrongowner");

        let found = stash.get_file(Some("u1"), &file.file_key).await.unwrap();
        assert_eq!(found.size, 4);
    }

    #[tokio::test]
    async fn test_lookup_errors() {
        let (stash, _dir) = setup().await;
        let err = stash.get_file(Some("u1"), "../etc/passwd").await.unwrap_err();
        assert_eq!(err.code(), "stashpathinvalid");
        let err = stash.get_file(Some("u1"), "abc.def.png").await.unwrap_err();
        assert_eq!(err.code(), "stashnosuchfilekey");
    }

    #[tokio::test]
    async fn test_chunks_concatenate_in_order() {
        let (stash, _dir) = setup().await;
        let first = stash
            .stash_bytes(Some("u1"), Bytes::from_static(b"Hello, "), "greeting.txt", true)
            .await
            .unwrap();
        assert!(first.is_partial);

        let appended = stash
            .append_chunk(Some("u1"), &first.file_key, Bytes::from_static(b"world"))
            .await
            .unwrap();
        assert_eq!(appended.size, 12);
        assert_eq!(appended.chunk_count, 2);

        let assembled = stash.concatenate_chunks(Some("u1"), &first.file_key).await.unwrap();
        assert_ne!(assembled.file_key, first.file_key);
        assert!(!assembled.is_partial);
        assert_eq!(assembled.size, 12);
        assert_eq!(stash.read_file(&assembled).await.unwrap(), b"Hello, world");
        assert_eq!(
            assembled.sha256.as_deref(),
            Some(hex::encode(Sha256::digest(b"Hello, world")).as_str())
        );
    }

    #[tokio::test]
    async fn test_download_to_temp_copies_entry() {
        let (stash, _dir) = setup().await;
        let data = vec![b'z'; 200 * 1024];
        let file = stash
            .stash_bytes(Some("u1"), Bytes::from(data.clone()), "big.png", false)
            .await
            .unwrap();

        let temp = stash.download_to_temp(&file).await.unwrap();
        assert_eq!(std::fs::read(temp.path()).unwrap(), data);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (stash, _dir) = setup().await;
        let file = stash
            .stash_bytes(Some("u1"), Bytes::from_static(b"bytes"), "a.png", true)
            .await
            .unwrap();
        stash.remove_file(Some("u1"), &file.file_key).await.unwrap();
        stash.remove_file(Some("u1"), &file.file_key).await.unwrap();
        let err = stash.get_file(Some("u1"), &file.file_key).await.unwrap_err();
        assert_eq!(err.code(), "stashnosuchfilekey");
    }

    #[tokio::test]
    async fn test_session_round_trip_and_clear() {
        let (stash, _dir) = setup().await;
        assert!(stash.get_session_status(Some("u1"), "k.png").await.unwrap().is_none());

        let mut session = UploadSession::new("k.png", "u1", UploadResult::Continue, UploadStage::Uploading);
        session.offset = 2000;
        session.file_size = Some(3000);
        assert!(stash.set_session_status(Some("u1"), "k.png", Some(&session)).await.unwrap());

        let first = stash.get_session_status(Some("u1"), "k.png").await.unwrap();
        let second = stash.get_session_status(Some("u1"), "k.png").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.unwrap().offset, 2000);

        let err = stash.get_session_status(Some("u2"), "k.png").await.unwrap_err();
        assert_eq!(err.code(), "stashwrongowner");

        stash.set_session_status(Some("u1"), "k.png", None).await.unwrap();
        assert!(stash.get_session_status(Some("u1"), "k.png").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_terminal_session_is_not_overwritten() {
        let (stash, _dir) = setup().await;
        let session = UploadSession::new("k.png", "u1", UploadResult::Failure, UploadStage::Assembling);
        stash.set_session_status(Some("u1"), "k.png", Some(&session)).await.unwrap();

        let retry = session.transition(UploadResult::Continue, UploadStage::Uploading);
        assert!(!stash.set_session_status(Some("u1"), "k.png", Some(&retry)).await.unwrap());
        assert!(stash.set_session_status(Some("u1"), "k.png", Some(&session)).await.unwrap());

        let stored = stash.get_session_status(Some("u1"), "k.png").await.unwrap().unwrap();
        assert_eq!(stored.result, UploadResult::Failure);
    }

    #[tokio::test]
    async fn test_offset_never_moves_backwards() {
        let (stash, _dir) = setup().await;
        let mut session = UploadSession::new("k.png", "u1", UploadResult::Continue, UploadStage::Uploading);
        session.offset = 2000;
        session.file_size = Some(3000);
        stash.set_session_status(Some("u1"), "k.png", Some(&session)).await.unwrap();

        session.offset = 1000;
        assert!(!stash.set_session_status(Some("u1"), "k.png", Some(&session)).await.unwrap());

        session.offset = 4000;
        assert!(!stash.set_session_status(Some("u1"), "k.png", Some(&session)).await.unwrap());
    }
}
