use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};

use crate::api::error::ApiError;
use crate::models::{SessionStatus, UploadResult, UploadSession, UploadStage};
use crate::services::chunks::ChunkAssembler;
use crate::services::identity::Identity;
use crate::services::publisher::{PublishContent, PublishRequest, Publisher};
use crate::services::stash::UploadStash;
use crate::services::verification::{UploadCandidate, VerificationPipeline};
use crate::utils::keyed_mutex::KeyedMutex;

#[derive(Debug, Clone)]
pub enum UploadJob {
    AssembleChunks {
        filename: String,
        file_key: String,
        identity: Identity,
    },
    PublishStashedFile {
        filename: String,
        file_key: String,
        comment: String,
        tags: Vec<String>,
        text: Option<String>,
        watch: bool,
        identity: Identity,
    },
}

impl UploadJob {
    pub fn kind(&self) -> &'static str {
        match self {
            UploadJob::AssembleChunks { .. } => "assemble-chunks",
            UploadJob::PublishStashedFile { .. } => "publish-stashed-file",
        }
    }

    pub fn file_key(&self) -> &str {
        match self {
            UploadJob::AssembleChunks { file_key, .. }
            | UploadJob::PublishStashedFile { file_key, .. } => file_key,
        }
    }
}

/// Bounded queue feeding a fixed number of concurrent job executions.
#[derive(Clone)]
pub struct UploadJobQueue {
    tx: mpsc::Sender<UploadJob>,
}

impl UploadJobQueue {
    /// Spawns the worker pool. Once `queue_size` jobs are waiting, `submit` fails.
    pub fn new(runner: JobRunner, queue_size: usize, max_concurrent: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));

        tokio::spawn(async move {
            Self::worker_pool(rx, runner, max_concurrent.max(1)).await;
        });

        tracing::info!(
            queue_size = queue_size,
            max_concurrent = max_concurrent,
            "Upload job queue initialized"
        );

        Self { tx }
    }

    pub fn submit(&self, job: UploadJob) -> Result<(), ApiError> {
        tracing::info!(file_key = %job.file_key(), job_type = job.kind(), "Enqueuing upload job");
        self.tx.try_send(job).map_err(|e| match &e {
            mpsc::error::TrySendError::Full(_) => {
                tracing::warn!("Upload job queue is full, rejecting job");
                ApiError::internal("The upload job queue is full, please try again later")
            }
            _ => ApiError::internal(format!("Failed to submit upload job: {}", e)),
        })
    }

    async fn worker_pool(mut rx: mpsc::Receiver<UploadJob>, runner: JobRunner, max_concurrent: usize) {
        let semaphore = Arc::new(Semaphore::new(max_concurrent));

        while let Some(job) = rx.recv().await {
            let permit = semaphore.clone().acquire_owned().await;
            let runner = runner.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let kind = job.kind();
                let file_key = job.file_key().to_string();
                if let Err(e) = runner.run(job).await {
                    tracing::error!(file_key = %file_key, job_type = kind, error = %e, "Upload job failed");
                }
            });
        }
    }
}

/// Executes upload jobs. Safe against redelivery: each job holds the lock of
/// its file key and does nothing unless the session still waits for it.
#[derive(Clone)]
pub struct JobRunner {
    stash: UploadStash,
    assembler: ChunkAssembler,
    verifier: VerificationPipeline,
    publisher: Publisher,
    locks: KeyedMutex,
}

impl JobRunner {
    pub fn new(
        stash: UploadStash,
        assembler: ChunkAssembler,
        verifier: VerificationPipeline,
        publisher: Publisher,
        locks: KeyedMutex,
    ) -> Self {
        Self {
            stash,
            assembler,
            verifier,
            publisher,
            locks,
        }
    }

    #[tracing::instrument(skip(self, job), fields(job_type = job.kind(), file_key = %job.file_key()))]
    pub async fn run(&self, job: UploadJob) -> Result<(), ApiError> {
        let _guard = self.locks.lock(job.file_key()).await;
        let start = std::time::Instant::now();

        match job {
            UploadJob::AssembleChunks {
                filename,
                file_key,
                identity,
            } => self.assemble(&filename, &file_key, &identity).await?,
            UploadJob::PublishStashedFile {
                filename,
                file_key,
                comment,
                tags,
                text,
                watch,
                identity,
            } => {
                let request = PublishRequest {
                    name: filename,
                    comment,
                    text,
                    tags,
                    watch,
                    mime_type: None,
                };
                self.publish(request, &file_key, &identity).await?
            }
        }

        tracing::info!(duration_ms = start.elapsed().as_millis(), "Upload job finished");
        Ok(())
    }

    async fn pending_session(
        &self,
        owner: &str,
        file_key: &str,
        stages: &[UploadStage],
    ) -> Result<Option<UploadSession>, ApiError> {
        let session = self.stash.get_session_status(Some(owner), file_key).await?;
        match session {
            Some(s) if s.result == UploadResult::Poll && stages.contains(&s.stage) => Ok(Some(s)),
            other => {
                tracing::info!(
                    result = ?other.as_ref().map(|s| s.result),
                    stage = ?other.as_ref().map(|s| s.stage),
                    "Session is not waiting for this job, skipping"
                );
                Ok(None)
            }
        }
    }

    async fn assemble(
        &self,
        filename: &str,
        file_key: &str,
        identity: &Identity,
    ) -> Result<(), ApiError> {
        let owner = owner_of(identity)?;
        let Some(session) = self
            .pending_session(owner, file_key, &[UploadStage::Queued, UploadStage::Assembling])
            .await?
        else {
            return Ok(());
        };

        // Failures are already recorded in the session for the poller
        if let Err(e) = self.assembler.assemble(owner, &session, filename).await {
            tracing::warn!(code = %e.code, "Background assembly failed: {}", e.info);
        }
        Ok(())
    }

    async fn publish(
        &self,
        request: PublishRequest,
        file_key: &str,
        identity: &Identity,
    ) -> Result<(), ApiError> {
        let owner = owner_of(identity)?;
        let Some(session) = self
            .pending_session(owner, file_key, &[UploadStage::Queued, UploadStage::Publish])
            .await?
        else {
            return Ok(());
        };

        let publishing = session.transition(UploadResult::Poll, UploadStage::Publish);
        self.persist(owner, &publishing).await?;

        match self.verify_and_publish(owner, request, file_key, identity).await {
            Ok(session_status) => {
                let done = publishing
                    .transition(UploadResult::Success, UploadStage::Done)
                    .with_status(session_status);
                self.persist(owner, &done).await?;
                if let Err(e) = self.stash.remove_file(Some(owner), file_key).await {
                    tracing::warn!("Failed to remove published stash entry: {}", e);
                }
                tracing::info!("Published stashed file");
            }
            Err(e) => {
                tracing::warn!(code = %e.code, "Background publish failed: {}", e.info);
                let failed = publishing
                    .transition(UploadResult::Failure, UploadStage::Publish)
                    .with_status(SessionStatus {
                        error: Some(e.to_status_error()),
                        ..SessionStatus::default()
                    });
                self.persist(owner, &failed).await?;
            }
        }
        Ok(())
    }

    async fn verify_and_publish(
        &self,
        owner: &str,
        mut request: PublishRequest,
        file_key: &str,
        identity: &Identity,
    ) -> Result<SessionStatus, ApiError> {
        let stashed = self.stash.get_file(Some(owner), file_key).await?;
        let temp = self.stash.download_to_temp(&stashed).await?;
        let candidate = UploadCandidate {
            path: temp.path(),
            size: stashed.size,
            desired_name: &request.name,
        };
        let verified = self.verifier.verify(&candidate).await?;

        request.name = verified.filtered_name;
        request.mime_type = verified.mime_type;
        let info = self
            .publisher
            .publish(identity, &request, PublishContent::Stashed(&stashed))
            .await?;

        Ok(SessionStatus {
            filename: Some(info.name.clone()),
            fileinfo: Some(info),
            ..SessionStatus::default()
        })
    }

    async fn persist(&self, owner: &str, session: &UploadSession) -> Result<(), ApiError> {
        if !self
            .stash
            .set_session_status(Some(owner), &session.file_key, Some(session))
            .await?
        {
            tracing::warn!(file_key = %session.file_key, "Session update rejected");
        }
        Ok(())
    }
}

fn owner_of(identity: &Identity) -> Result<&str, ApiError> {
    identity.owner().ok_or_else(|| {
        ApiError::permission("mustbeloggedin", "Upload jobs need a logged in user")
    })
}
