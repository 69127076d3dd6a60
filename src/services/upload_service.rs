use bytes::Bytes;
use sea_orm::DatabaseConnection;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};

use crate::api::error::{ApiError, ErrorKind};
use crate::config::UploadConfig;
use crate::models::{
    SessionStatus, UploadParams, UploadResponse, UploadResult, UploadSession, UploadStage,
};
use crate::services::chunks::{ChunkAssembler, ChunkOutcome, ChunkSubmission};
use crate::services::identity::{Identity, RIGHT_UPLOAD_BY_URL};
use crate::services::jobs::{JobRunner, UploadJob, UploadJobQueue};
use crate::services::permissions::PermissionService;
use crate::services::publisher::{PublishContent, PublishRequest, Publisher, resolve_watch};
use crate::services::source::{TempUpload, UploadRequest, UploadSource, UrlFetcher};
use crate::services::stash::{StashError, StashedFile, UploadStash};
use crate::services::storage::StorageService;
use crate::services::verification::{UploadCandidate, VerificationPipeline};
use crate::services::warnings::{UploadWarnings, WarningService};
use crate::utils::keyed_mutex::KeyedMutex;

/// Source bytes made locally available, before any verdict on them.
enum Prepared {
    Local(TempUpload),
    Stashed {
        file: StashedFile,
        /// Local copy for content checks, absent when verification is deferred
        temp: Option<NamedTempFile>,
    },
    Chunk {
        data: Bytes,
        offset: u64,
        file_size: u64,
        file_key: Option<String>,
    },
}

impl Prepared {
    fn is_chunk(&self) -> bool {
        matches!(self, Prepared::Chunk { .. })
    }

    fn size(&self) -> u64 {
        match self {
            Prepared::Local(upload) => upload.size,
            Prepared::Stashed { file, .. } => file.size,
            Prepared::Chunk { file_size, .. } => *file_size,
        }
    }
}

/// Outcome of the sanity or verification step.
struct Checked {
    name: String,
    mime_type: Option<String>,
}

/// Sequences one upload request: select, fetch, verify, permissions, then
/// warnings, chunk, stash or publish handling.
#[derive(Clone)]
pub struct UploadService {
    config: Arc<UploadConfig>,
    stash: UploadStash,
    assembler: ChunkAssembler,
    verifier: VerificationPipeline,
    warnings: WarningService,
    permissions: PermissionService,
    publisher: Publisher,
    fetcher: UrlFetcher,
    jobs: UploadJobQueue,
    locks: KeyedMutex,
}

impl UploadService {
    /// Wires the pipeline together and starts the background job pool.
    pub fn new(
        db: DatabaseConnection,
        storage: Arc<dyn StorageService>,
        config: Arc<UploadConfig>,
        verifier: VerificationPipeline,
    ) -> anyhow::Result<Self> {
        let stash = UploadStash::new(db.clone(), storage.clone(), config.stash_expiry_hours);
        let warnings = WarningService::new(db.clone(), config.clone());
        let assembler = ChunkAssembler::new(
            stash.clone(),
            config.clone(),
            verifier.clone(),
            warnings.clone(),
        );
        let publisher = Publisher::new(db.clone(), storage);
        let locks = KeyedMutex::new();
        let runner = JobRunner::new(
            stash.clone(),
            assembler.clone(),
            verifier.clone(),
            publisher.clone(),
            locks.clone(),
        );
        let jobs = UploadJobQueue::new(runner, config.job_queue_size, config.job_workers);

        Ok(Self {
            fetcher: UrlFetcher::new(&config)?,
            permissions: PermissionService::new(db, config.clone()),
            config,
            stash,
            assembler,
            verifier,
            warnings,
            publisher,
            jobs,
            locks,
        })
    }

    pub fn stash(&self) -> &UploadStash {
        &self.stash
    }

    /// Per file key locks shared with the job runner.
    pub fn locks(&self) -> &KeyedMutex {
        &self.locks
    }

    pub async fn upload(
        &self,
        identity: &Identity,
        mut request: UploadRequest,
    ) -> Result<UploadResponse, ApiError> {
        if !self.config.enable_uploads {
            return Err(ApiError::client(
                "uploaddisabled",
                "Uploads are not enabled. Make sure the upload module is switched on.",
            ));
        }
        if request.params.async_mode && !self.config.enable_async_uploads {
            request.params.async_mode = false;
        }

        if request.params.checkstatus {
            if let Some(file_key) = request.file_key() {
                return self.check_status(identity, file_key).await;
            }
        }

        let params = request.params.clone();
        let desired = params.filename.clone().unwrap_or_default();

        let source = UploadSource::select(request, &self.config)?;
        if matches!(source, UploadSource::RemoteUrl(_)) && !identity.has_right(RIGHT_UPLOAD_BY_URL) {
            return Err(ApiError::permission(
                "permissiondenied",
                "You don't have permission to upload files by URL",
            ));
        }
        info!(source = source.kind(), filename = %desired, user_id = ?identity.owner(), "Upload request");

        let source = self.fetcher.fetch(source).await?;
        let prepared = self.prepare(identity, source, &params).await?;

        let checked = match self.check(&prepared, &desired, &params).await {
            Ok(checked) => checked,
            Err(e) => return Err(self.recoverable(identity, &prepared, &desired, e).await),
        };

        self.permissions.check_upload_permission(identity)?;
        if !params.stash {
            if let Err(e) = self
                .permissions
                .check_title_permission(identity, &checked.name)
                .await
            {
                return Err(self.recoverable(identity, &prepared, &desired, e).await);
            }
        }

        self.dispatch(identity, prepared, checked, &desired, &params).await
    }

    /// Replays the persisted state of a session.
    async fn check_status(
        &self,
        identity: &Identity,
        file_key: &str,
    ) -> Result<UploadResponse, ApiError> {
        let session = self
            .stash
            .get_session_status(identity.owner(), file_key)
            .await?
            .ok_or_else(|| ApiError::client("missingresult", "No result in status data"))?;

        if let Some(error) = &session.status.error {
            return Err(ApiError::from_status_error(error));
        }

        let mut response = UploadResponse::new(session.result);
        response.set_filekey(session.status.filekey.as_deref().unwrap_or(file_key));
        response.stage = Some(session.stage);
        if session.stage == UploadStage::Uploading {
            response.offset = Some(session.offset);
        }
        response.warnings = session.status.warnings;
        response.filename = session.status.filename;
        response.fileinfo = session.status.fileinfo;
        Ok(response)
    }

    async fn prepare(
        &self,
        identity: &Identity,
        source: UploadSource,
        params: &UploadParams,
    ) -> Result<Prepared, ApiError> {
        match source {
            UploadSource::LocalFile(upload) => Ok(Prepared::Local(upload)),
            UploadSource::Stash { file_key } => {
                let file = self.stash.get_file(identity.owner(), &file_key).await?;
                let temp = if params.async_mode {
                    None
                } else {
                    Some(self.stash.download_to_temp(&file).await?)
                };
                Ok(Prepared::Stashed { file, temp })
            }
            UploadSource::Chunk {
                data,
                offset,
                file_size,
                file_key,
            } => Ok(Prepared::Chunk {
                data,
                offset,
                file_size,
                file_key,
            }),
            UploadSource::RemoteUrl(url) => Err(ApiError::internal(format!(
                "{} was not fetched before verification",
                url
            ))),
        }
    }

    /// Size and name sanity for chunks, full verification for everything else.
    async fn check(
        &self,
        prepared: &Prepared,
        desired: &str,
        params: &UploadParams,
    ) -> Result<Checked, ApiError> {
        let path = match prepared {
            Prepared::Chunk { file_size, .. } => {
                let max = self.config.max_upload_size as u64;
                if *file_size > max {
                    return Err(ApiError::new(
                        ErrorKind::FatalContent,
                        "file-too-large",
                        format!("The file is bigger than the maximum of {} bytes", max),
                    ));
                }
                let name = self.verifier.check_name(desired)?;
                return Ok(Checked {
                    name,
                    mime_type: None,
                });
            }
            Prepared::Stashed { temp: None, .. } => {
                // Content checks run in the publish job
                let name = self.verifier.check_name(desired)?;
                return Ok(Checked {
                    name,
                    mime_type: None,
                });
            }
            Prepared::Stashed {
                temp: Some(temp), ..
            } => temp.path(),
            Prepared::Local(upload) => upload.file.path(),
        };

        let candidate = UploadCandidate {
            path,
            size: prepared.size(),
            desired_name: desired,
        };
        let verified = self.verifier.verify(&candidate).await?;
        if params.async_mode {
            info!(name = %verified.filtered_name, "Verified upload ahead of queued publish");
        }
        Ok(Checked {
            name: verified.filtered_name,
            mime_type: verified.mime_type,
        })
    }

    async fn dispatch(
        &self,
        identity: &Identity,
        prepared: Prepared,
        checked: Checked,
        desired: &str,
        params: &UploadParams,
    ) -> Result<UploadResponse, ApiError> {
        let mut warnings = UploadWarnings::default();
        if !prepared.is_chunk() {
            let sha256 = self.content_hash(&prepared).await?;
            warnings = self
                .warnings
                .check(desired, &checked.name, prepared.size(), sha256.as_deref())
                .await?;

            if !params.ignorewarnings && warnings.is_blocking() {
                info!(name = %checked.name, "Upload stopped on warnings");
                let mut response = UploadResponse::new(UploadResult::Warning);
                response.warnings = warnings.to_value();
                match self.optional_stash(identity, &prepared, desired).await {
                    Ok(key) => response.set_filekey(key),
                    Err(msg) => response.stashfailed = Some(msg),
                }
                return Ok(response);
            }
        }

        if let Prepared::Chunk {
            data,
            offset,
            file_size,
            file_key,
        } = prepared
        {
            let submission = ChunkSubmission {
                desired_name: desired,
                data,
                offset,
                file_size,
                file_key: file_key.as_deref(),
            };
            return self.chunk_result(identity, submission, params).await;
        }

        if params.stash {
            let key = self.critical_stash(identity, &prepared, desired).await?;
            let mut response = UploadResponse::new(UploadResult::Success);
            response.set_filekey(key);
            response.warnings = warnings.to_value();
            return Ok(response);
        }

        self.permissions.check_throttle(identity).await?;
        self.permissions.check_tags(identity, &params.tags)?;

        let request = PublishRequest {
            name: checked.name,
            comment: params.comment.clone(),
            text: params.text.clone(),
            tags: params.tags.clone(),
            watch: resolve_watch(params.watchlist, params.watch, identity),
            mime_type: checked.mime_type,
        };

        match &prepared {
            Prepared::Stashed { file, .. } if params.async_mode => {
                self.queue_publish(identity, request, &file.file_key).await
            }
            _ => self.publish_now(identity, &prepared, request, desired, warnings).await,
        }
    }

    async fn chunk_result(
        &self,
        identity: &Identity,
        chunk: ChunkSubmission<'_>,
        params: &UploadParams,
    ) -> Result<UploadResponse, ApiError> {
        let owner = owner_of(identity)?;
        let desired = chunk.desired_name;
        // Held through assembly so a retried chunk sees the finished session
        let _guard = match chunk.file_key {
            Some(key) => Some(self.locks.lock(key).await),
            None => None,
        };

        match self.assembler.add_chunk(owner, chunk).await? {
            ChunkOutcome::Continue { file_key, offset } => {
                let mut response = UploadResponse::new(UploadResult::Continue);
                response.set_filekey(file_key);
                response.offset = Some(offset);
                Ok(response)
            }
            ChunkOutcome::Complete { file_key, session } if params.async_mode => {
                let queued = session.transition(UploadResult::Poll, UploadStage::Queued);
                self.stash
                    .set_session_status(Some(owner), &file_key, Some(&queued))
                    .await?;

                let job = UploadJob::AssembleChunks {
                    filename: desired.to_string(),
                    file_key: file_key.clone(),
                    identity: identity.clone(),
                };
                if let Err(e) = self.jobs.submit(job) {
                    let failed = queued
                        .transition(UploadResult::Failure, UploadStage::Queued)
                        .with_status(SessionStatus {
                            error: Some(e.to_status_error()),
                            ..SessionStatus::default()
                        });
                    self.stash
                        .set_session_status(Some(owner), &file_key, Some(&failed))
                        .await?;
                    return Err(e);
                }

                let mut response = UploadResponse::new(UploadResult::Poll);
                response.set_filekey(file_key);
                response.stage = Some(UploadStage::Queued);
                Ok(response)
            }
            ChunkOutcome::Complete { session, .. } => {
                let assembled = self.assembler.assemble(owner, &session, desired).await?;
                let mut response = UploadResponse::new(UploadResult::Success);
                response.set_filekey(assembled.file.file_key);
                response.warnings = assembled.warnings.to_value();
                Ok(response)
            }
        }
    }

    async fn queue_publish(
        &self,
        identity: &Identity,
        request: PublishRequest,
        file_key: &str,
    ) -> Result<UploadResponse, ApiError> {
        let owner = owner_of(identity)?;
        let _guard = self.locks.lock(file_key).await;
        match self.stash.get_session_status(Some(owner), file_key).await? {
            Some(session) if session.result == UploadResult::Poll => {
                return Err(ApiError::client(
                    "publishfailed",
                    "Upload from stash already in progress.",
                ));
            }
            Some(session) if session.result.is_terminal() => {
                self.stash.set_session_status(Some(owner), file_key, None).await?;
            }
            _ => {}
        }

        let queued = UploadSession::new(file_key, owner, UploadResult::Poll, UploadStage::Queued);
        self.stash
            .set_session_status(Some(owner), file_key, Some(&queued))
            .await?;

        let job = UploadJob::PublishStashedFile {
            filename: request.name,
            file_key: file_key.to_string(),
            comment: request.comment,
            tags: request.tags,
            text: request.text,
            watch: request.watch,
            identity: identity.clone(),
        };
        if let Err(e) = self.jobs.submit(job) {
            self.stash.set_session_status(Some(owner), file_key, None).await?;
            return Err(e);
        }

        let mut response = UploadResponse::new(UploadResult::Poll);
        response.set_filekey(file_key);
        response.stage = Some(UploadStage::Queued);
        Ok(response)
    }

    async fn publish_now(
        &self,
        identity: &Identity,
        prepared: &Prepared,
        request: PublishRequest,
        desired: &str,
        warnings: UploadWarnings,
    ) -> Result<UploadResponse, ApiError> {
        let content = match prepared {
            Prepared::Local(upload) => PublishContent::Path(upload.file.path()),
            Prepared::Stashed { file, .. } => PublishContent::Stashed(file),
            Prepared::Chunk { .. } => {
                return Err(ApiError::internal("A chunk cannot be published directly"));
            }
        };

        let info = match self.publisher.publish(identity, &request, content).await {
            Ok(info) => info,
            Err(e) => {
                warn!(name = %request.name, code = %e.code, "Publish failed: {}", e.info);
                let err = ApiError::new(
                    ErrorKind::RecoverableContent,
                    "internal-error",
                    "An internal error occurred",
                )
                .with_data("details", vec![e.code, e.info]);
                return Err(self.recoverable(identity, prepared, desired, err).await);
            }
        };

        if let Prepared::Stashed { file, .. } = prepared {
            if let Err(e) = self.stash.remove_file(identity.owner(), &file.file_key).await {
                warn!(file_key = %file.file_key, "Failed to remove published stash entry: {}", e);
            }
        }

        let mut response = UploadResponse::new(UploadResult::Success);
        response.filename = Some(info.name.clone());
        response.fileinfo = Some(info);
        response.warnings = warnings.to_value();
        Ok(response)
    }

    /// Stash for a request that asked for it. Failure fails the request.
    async fn critical_stash(
        &self,
        identity: &Identity,
        prepared: &Prepared,
        name: &str,
    ) -> Result<String, ApiError> {
        match prepared {
            Prepared::Local(upload) => Ok(self
                .stash
                .stash_file(identity.owner(), upload.file.path(), name)
                .await?
                .file_key),
            Prepared::Stashed { file, .. } => Ok(file.file_key.clone()),
            Prepared::Chunk { .. } => Err(ApiError::stash_failed(
                "Chunks are stashed by the chunk handler",
            )),
        }
    }

    /// Best effort stash so the client can retry without sending the bytes again.
    async fn optional_stash(
        &self,
        identity: &Identity,
        prepared: &Prepared,
        name: &str,
    ) -> Result<String, String> {
        self.critical_stash(identity, prepared, name)
            .await
            .map_err(|e| {
                warn!(code = %e.code, "Optional stash failed: {}", e.info);
                e.info
            })
    }

    /// Attaches a filekey to a user-fixable error, or `stashfailed` when that is impossible.
    async fn recoverable(
        &self,
        identity: &Identity,
        prepared: &Prepared,
        name: &str,
        err: ApiError,
    ) -> ApiError {
        if !err.is_recoverable() || prepared.is_chunk() {
            return err;
        }
        match self.optional_stash(identity, prepared, name).await {
            Ok(key) => err
                .with_data("filekey", key.as_str())
                .with_data("sessionkey", key.as_str()),
            Err(msg) => err.with_data("stashfailed", msg),
        }
    }

    async fn content_hash(&self, prepared: &Prepared) -> Result<Option<String>, ApiError> {
        match prepared {
            Prepared::Local(upload) => hash_file(upload.file.path())
                .await
                .map(Some)
                .map_err(|e| ApiError::internal(format!("Failed to hash upload: {}", e))),
            Prepared::Stashed { file, .. } => Ok(file.sha256.clone()),
            Prepared::Chunk { .. } => Ok(None),
        }
    }
}

fn owner_of(identity: &Identity) -> Result<&str, ApiError> {
    identity
        .owner()
        .ok_or_else(|| StashError::NotLoggedIn.into())
}

async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
