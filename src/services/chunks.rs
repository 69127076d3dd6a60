use bytes::Bytes;
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::error::ApiError;
use crate::config::UploadConfig;
use crate::models::{SessionStatus, UploadResult, UploadSession, UploadStage};
use crate::services::stash::{StashedFile, UploadStash};
use crate::services::verification::{UploadCandidate, VerificationPipeline, VerifiedFile};
use crate::services::warnings::{UploadWarnings, WarningService};

/// One chunk as submitted by the client.
#[derive(Debug, Clone)]
pub struct ChunkSubmission<'a> {
    pub desired_name: &'a str,
    pub data: Bytes,
    pub offset: u64,
    pub file_size: u64,
    /// Session to continue, `None` for the first chunk
    pub file_key: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// More bytes are expected, starting at `offset`.
    Continue { file_key: String, offset: u64 },
    /// Every declared byte has arrived; the session is ready for assembly.
    Complete { file_key: String, session: UploadSession },
}

/// A concatenated, verified file together with its warnings.
#[derive(Debug, Clone)]
pub struct AssembledUpload {
    pub file: StashedFile,
    pub verified: VerifiedFile,
    pub warnings: UploadWarnings,
}

/// Accepts chunks into partial stash entries and turns complete ones into files.
#[derive(Clone)]
pub struct ChunkAssembler {
    stash: UploadStash,
    config: Arc<UploadConfig>,
    verifier: VerificationPipeline,
    warnings: WarningService,
}

impl ChunkAssembler {
    pub fn new(
        stash: UploadStash,
        config: Arc<UploadConfig>,
        verifier: VerificationPipeline,
        warnings: WarningService,
    ) -> Self {
        Self {
            stash,
            config,
            verifier,
            warnings,
        }
    }

    /// Bounds checks that need nothing but the request itself.
    pub fn validate(&self, offset: u64, len: u64, file_size: u64) -> Result<(), ApiError> {
        if offset > file_size || len > file_size - offset {
            return Err(ApiError::client(
                "invalid-chunk",
                "Offset plus current chunk is greater than claimed file size",
            ));
        }
        let min = self.config.min_chunk_size as u64;
        if len < file_size - offset && len < min {
            return Err(ApiError::client(
                "chunk-too-small",
                format!("Minimum chunk size is {} bytes for non-final chunks", min),
            ));
        }
        Ok(())
    }

    pub async fn add_chunk(
        &self,
        owner: &str,
        chunk: ChunkSubmission<'_>,
    ) -> Result<ChunkOutcome, ApiError> {
        let len = chunk.data.len() as u64;
        self.validate(chunk.offset, len, chunk.file_size)?;

        let session = match chunk.file_key {
            None => {
                let stashed = self
                    .stash
                    .stash_bytes(Some(owner), chunk.data, chunk.desired_name, true)
                    .await?;
                let mut session = UploadSession::new(
                    &stashed.file_key,
                    owner,
                    UploadResult::Continue,
                    UploadStage::Uploading,
                );
                session.offset = len;
                session.file_size = Some(chunk.file_size);
                session
            }
            Some(file_key) => {
                let current = self
                    .stash
                    .get_session_status(Some(owner), file_key)
                    .await?
                    .ok_or_else(|| {
                        ApiError::stash_failed("No chunked upload session with this key")
                    })?;

                if !current.is_accepting_chunks() {
                    return Err(ApiError::stash_failed(
                        "Chunked upload is already completed, check status for details",
                    ));
                }
                if current.file_size != Some(chunk.file_size) {
                    return Err(ApiError::bad_params(
                        "The filesize does not match the size declared by the first chunk",
                    ));
                }
                if chunk.offset != current.offset {
                    return Err(ApiError::stash_failed(format!(
                        "Offset {} does not match the {} bytes received so far",
                        chunk.offset, current.offset
                    ))
                    .with_data("offset", current.offset));
                }

                if let Err(e) = self
                    .stash
                    .append_chunk(Some(owner), file_key, chunk.data)
                    .await
                {
                    warn!(file_key = %file_key, "Failed to append chunk: {}", e);
                    return Err(
                        ApiError::stash_failed(e.to_string()).with_data("offset", current.offset)
                    );
                }

                let mut next = current.clone();
                next.offset = current.offset + len;
                next
            }
        };

        if !self
            .stash
            .set_session_status(Some(owner), &session.file_key, Some(&session))
            .await?
        {
            return Err(ApiError::stash_failed(
                "The upload session changed while the chunk was being stored",
            ));
        }

        info!(
            file_key = %session.file_key,
            offset = session.offset,
            file_size = chunk.file_size,
            "Accepted chunk"
        );

        if session.offset == chunk.file_size {
            Ok(ChunkOutcome::Complete {
                file_key: session.file_key.clone(),
                session,
            })
        } else {
            Ok(ChunkOutcome::Continue {
                file_key: session.file_key.clone(),
                offset: session.offset,
            })
        }
    }

    /// Concatenates the chunks of `session`, verifies the result and computes warnings.
    ///
    /// Any failure is written into the session before it is returned. On success
    /// the session ends as `Success` pointing at the key of the assembled file,
    /// and the partial entry is removed.
    pub async fn assemble(
        &self,
        owner: &str,
        session: &UploadSession,
        desired_name: &str,
    ) -> Result<AssembledUpload, ApiError> {
        let file_key = session.file_key.as_str();
        self.persist(owner, &session.transition(UploadResult::Poll, UploadStage::Assembling))
            .await?;

        let file = match self.stash.concatenate_chunks(Some(owner), file_key).await {
            Ok(file) => file,
            Err(e) => {
                warn!(file_key = %file_key, "Chunk assembly failed: {}", e);
                let err = ApiError::stash_failed(e.to_string());
                self.fail(owner, session, &err, None).await?;
                return Err(err);
            }
        };

        if let Err(e) = self.stash.remove_file(Some(owner), file_key).await {
            warn!(file_key = %file_key, "Failed to remove assembled chunks: {}", e);
        }

        let temp = self.stash.download_to_temp(&file).await?;
        let candidate = UploadCandidate {
            path: temp.path(),
            size: file.size,
            desired_name,
        };
        let verified = match self.verifier.verify(&candidate).await {
            Ok(verified) => verified,
            Err(failure) => {
                let recoverable = failure.is_recoverable();
                let mut err: ApiError = failure.into();
                if recoverable {
                    err = err
                        .with_data("filekey", file.file_key.as_str())
                        .with_data("sessionkey", file.file_key.as_str());
                    self.fail(owner, session, &err, Some(&file.file_key)).await?;
                } else {
                    self.fail(owner, session, &err, None).await?;
                    if let Err(e) = self.stash.remove_file(Some(owner), &file.file_key).await {
                        warn!(file_key = %file.file_key, "Failed to remove rejected file: {}", e);
                    }
                }
                return Err(err);
            }
        };

        let warnings = self
            .warnings
            .check(
                desired_name,
                &verified.filtered_name,
                file.size,
                file.sha256.as_deref(),
            )
            .await?;

        let done = session
            .transition(UploadResult::Success, UploadStage::Assembling)
            .with_status(SessionStatus {
                filekey: Some(file.file_key.clone()),
                warnings: warnings.to_value(),
                ..SessionStatus::default()
            });
        self.persist(owner, &done).await?;

        info!(file_key = %file_key, new_key = %file.file_key, size = file.size, "Assembled chunked upload");
        Ok(AssembledUpload {
            file,
            verified,
            warnings,
        })
    }

    async fn fail(
        &self,
        owner: &str,
        session: &UploadSession,
        err: &ApiError,
        new_key: Option<&str>,
    ) -> Result<(), ApiError> {
        let failed = session
            .transition(UploadResult::Failure, UploadStage::Assembling)
            .with_status(SessionStatus {
                filekey: new_key.map(|k| k.to_string()),
                error: Some(err.to_status_error()),
                ..SessionStatus::default()
            });
        self.persist(owner, &failed).await
    }

    async fn persist(&self, owner: &str, session: &UploadSession) -> Result<(), ApiError> {
        if !self
            .stash
            .set_session_status(Some(owner), &session.file_key, Some(session))
            .await?
        {
            warn!(file_key = %session.file_key, "Session update rejected during assembly");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::run_migrations;
    use crate::services::scanner::NoOpScanner;
    use crate::services::storage::{LocalStorageService, StorageService};
    use sea_orm::Database;

    async fn setup(min_chunk_size: usize) -> (ChunkAssembler, UploadStash, tempfile::TempDir) {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn StorageService> = Arc::new(LocalStorageService::new(dir.path()));
        let config = Arc::new(UploadConfig {
            min_chunk_size,
            ..UploadConfig::default()
        });
        let stash = UploadStash::new(db.clone(), storage, 48);
        let verifier = VerificationPipeline::new(config.clone(), Arc::new(NoOpScanner));
        let warnings = WarningService::new(db, config.clone());
        (
            ChunkAssembler::new(stash.clone(), config, verifier, warnings),
            stash,
            dir,
        )
    }

    fn chunk<'a>(data: &'static [u8], offset: u64, file_size: u64, file_key: Option<&'a str>) -> ChunkSubmission<'a> {
        ChunkSubmission {
            desired_name: "Chunked.png",
            data: Bytes::from_static(data),
            offset,
            file_size,
            file_key,
        }
    }

    #[tokio::test]
    async fn test_bounds() {
        let (assembler, _stash, _dir) = setup(4).await;
        assert_eq!(assembler.validate(0, 11, 10).unwrap_err().code, "invalid-chunk");
        assert_eq!(assembler.validate(0, 3, 10).unwrap_err().code, "chunk-too-small");
        // A short final chunk is fine
        assert!(assembler.validate(8, 2, 10).is_ok());
        assert!(assembler.validate(0, 4, 10).is_ok());
    }

    #[tokio::test]
    async fn test_huge_offset_is_out_of_bounds() {
        let (assembler, _stash, _dir) = setup(4).await;
        assert_eq!(assembler.validate(u64::MAX, 2, 10).unwrap_err().code, "invalid-chunk");
        assert_eq!(assembler.validate(11, 0, 10).unwrap_err().code, "invalid-chunk");
        assert_eq!(
            assembler.validate(u64::MAX - 1, 2, u64::MAX).unwrap_err().code,
            "chunk-too-small"
        );
    }

    #[tokio::test]
    async fn test_chunks_then_assembly() {
        let (assembler, stash, _dir) = setup(4).await;

        let first = assembler.add_chunk("u1", chunk(b"aaaa", 0, 10, None)).await.unwrap();
        let ChunkOutcome::Continue { file_key, offset } = first else {
            panic!("expected Continue");
        };
        assert_eq!(offset, 4);

        let err = assembler
            .add_chunk("u1", chunk(b"bbbb", 2, 10, Some(&file_key)))
            .await
            .unwrap_err();
        assert_eq!(err.code, "stashfailed");
        assert_eq!(err.data["offset"], 4);

        let second = assembler
            .add_chunk("u1", chunk(b"bbbb", 4, 10, Some(&file_key)))
            .await
            .unwrap();
        assert!(matches!(second, ChunkOutcome::Continue { offset: 8, .. }));

        let last = assembler
            .add_chunk("u1", chunk(b"cc", 8, 10, Some(&file_key)))
            .await
            .unwrap();
        let ChunkOutcome::Complete { session, .. } = last else {
            panic!("expected Complete");
        };

        let assembled = assembler.assemble("u1", &session, "Chunked.png").await.unwrap();
        assert_ne!(assembled.file.file_key, file_key);
        assert_eq!(assembled.file.size, 10);
        assert_eq!(stash.read_file(&assembled.file).await.unwrap(), b"aaaabbbbcc");

        let stored = stash.get_session_status(Some("u1"), &file_key).await.unwrap().unwrap();
        assert_eq!(stored.result, UploadResult::Success);
        assert_eq!(stored.status.filekey.as_deref(), Some(assembled.file.file_key.as_str()));

        // The old key is finished, more chunks are refused
        let err = assembler
            .add_chunk("u1", chunk(b"dd", 8, 10, Some(&file_key)))
            .await
            .unwrap_err();
        assert_eq!(err.code, "stashfailed");
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (assembler, _stash, _dir) = setup(4).await;
        let err = assembler
            .add_chunk("u1", chunk(b"bbbb", 4, 10, Some("abc.def.png")))
            .await
            .unwrap_err();
        assert_eq!(err.code, "stashfailed");
    }

    #[tokio::test]
    async fn test_declared_size_must_not_change() {
        let (assembler, _stash, _dir) = setup(4).await;
        let ChunkOutcome::Continue { file_key, .. } =
            assembler.add_chunk("u1", chunk(b"aaaa", 0, 10, None)).await.unwrap()
        else {
            panic!("expected Continue");
        };
        let err = assembler
            .add_chunk("u1", chunk(b"bbbb", 4, 12, Some(&file_key)))
            .await
            .unwrap_err();
        assert_eq!(err.code, "badparams");
    }

    #[tokio::test]
    async fn test_failed_verification_is_persisted() {
        let (assembler, stash, _dir) = setup(1).await;
        let ChunkOutcome::Complete { file_key, session } =
            assembler.add_chunk("u1", chunk(b"data", 0, 4, None)).await.unwrap()
        else {
            panic!("expected Complete");
        };

        let err = assembler.assemble("u1", &session, "no-extension").await.unwrap_err();
        assert_eq!(err.code, "filetype-missing");
        assert!(err.data.contains_key("filekey"));

        let stored = stash.get_session_status(Some("u1"), &file_key).await.unwrap().unwrap();
        assert_eq!(stored.result, UploadResult::Failure);
        assert_eq!(stored.status.error.unwrap().code, "filetype-missing");
    }
}
