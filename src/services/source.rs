use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::api::error::{ApiError, ErrorKind};
use crate::config::UploadConfig;
use crate::models::UploadParams;
use crate::utils::validation::is_valid_file_key;

/// A whole-file payload spooled to local disk. The file is removed when dropped.
#[derive(Debug)]
pub struct TempUpload {
    pub file: NamedTempFile,
    pub size: u64,
}

/// One upload request: scalar parameters plus whichever payload came with them.
#[derive(Debug, Default)]
pub struct UploadRequest {
    pub params: UploadParams,
    pub file: Option<TempUpload>,
    pub chunk: Option<Bytes>,
}

impl UploadRequest {
    /// `filekey`, falling back to the deprecated `sessionkey`.
    pub fn file_key(&self) -> Option<&str> {
        self.params
            .filekey
            .as_deref()
            .or(self.params.sessionkey.as_deref())
            .filter(|k| !k.is_empty())
    }
}

/// Where the bytes of an upload come from, chosen once per request.
#[derive(Debug)]
pub enum UploadSource {
    LocalFile(TempUpload),
    RemoteUrl(Url),
    Stash {
        file_key: String,
    },
    Chunk {
        data: Bytes,
        offset: u64,
        file_size: u64,
        /// `None` for the first chunk, which opens a new session
        file_key: Option<String>,
    },
}

impl UploadSource {
    pub fn kind(&self) -> &'static str {
        match self {
            UploadSource::LocalFile(_) => "file",
            UploadSource::RemoteUrl(_) => "url",
            UploadSource::Stash { .. } => "stash",
            UploadSource::Chunk { .. } => "chunk",
        }
    }

    pub fn is_chunk(&self) -> bool {
        matches!(self, UploadSource::Chunk { .. })
    }

    /// Picks exactly one source out of `request`, or reports why none fits.
    pub fn select(request: UploadRequest, config: &UploadConfig) -> Result<Self, ApiError> {
        let file_key = request.file_key().map(|k| k.to_string());
        let UploadRequest {
            params,
            file,
            chunk,
        } = request;

        if chunk.is_none() {
            let supplied = [file_key.is_some(), file.is_some(), params.url.is_some()]
                .into_iter()
                .filter(|s| *s)
                .count();
            if supplied > 1 {
                return Err(ApiError::client(
                    "invalidparammix",
                    "The parameters \"filekey\", \"file\" and \"url\" can not be used together.",
                ));
            }
            if supplied == 0 {
                return Err(ApiError::client(
                    "missingparam",
                    "One of the parameters \"filekey\", \"file\" and \"url\" is required.",
                ));
            }
        }

        if params.filename.as_deref().is_none_or(str::is_empty) {
            return Err(ApiError::missing_param("filename"));
        }

        if let Some(data) = chunk {
            let offset = params.offset.unwrap_or(0);
            let file_size = params
                .filesize
                .ok_or_else(|| ApiError::missing_param("filesize"))?;

            match &file_key {
                Some(_) if offset == 0 => {
                    return Err(ApiError::bad_params(
                        "Cannot supply a filekey when offset is 0",
                    ));
                }
                None if offset != 0 => {
                    return Err(ApiError::bad_params(
                        "Must supply a filekey when offset is non-zero",
                    ));
                }
                _ => {}
            }
            if let Some(key) = &file_key {
                check_file_key(key)?;
            }

            return Ok(UploadSource::Chunk {
                data,
                offset,
                file_size,
                file_key,
            });
        }

        if let Some(file_key) = file_key {
            check_file_key(&file_key)?;
            return Ok(UploadSource::Stash { file_key });
        }

        if let Some(upload) = file {
            return Ok(UploadSource::LocalFile(upload));
        }

        match params.url {
            Some(raw) => Ok(UploadSource::RemoteUrl(check_url(&raw, config)?)),
            None => Err(ApiError::client(
                "missingparam",
                "One of the parameters \"filekey\", \"file\" and \"url\" is required.",
            )),
        }
    }
}

fn check_file_key(key: &str) -> Result<(), ApiError> {
    if is_valid_file_key(key) {
        Ok(())
    } else {
        Err(ApiError::client("invalid-file-key", "Not a valid filekey."))
    }
}

fn check_url(raw: &str, config: &UploadConfig) -> Result<Url, ApiError> {
    if !config.enable_url_uploads {
        return Err(ApiError::client(
            "copyuploaddisabled",
            "Upload by URL is disabled on this server.",
        ));
    }

    let bad_url = || ApiError::client("copyuploadbadurl", "Upload not allowed from this URL.");
    let url = Url::parse(raw).map_err(|_| bad_url())?;

    let host = url.host_str().unwrap_or_default().to_lowercase();
    if !is_allowed_host(&host, &config.url_allowed_domains) {
        return Err(ApiError::client(
            "copyuploadbaddomain",
            "Uploads by URL are not allowed from this domain.",
        ));
    }

    if !matches!(url.scheme(), "http" | "https") || host.is_empty() {
        return Err(bad_url());
    }
    Ok(url)
}

/// An empty allow list accepts any host. `*.example.org` also matches subdomains.
fn is_allowed_host(host: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    allowed.iter().any(|domain| match domain.strip_prefix("*.") {
        Some(base) => host == base || host.ends_with(&format!(".{}", base)),
        None => host == domain,
    })
}

/// Downloads remote sources into a temporary file.
#[derive(Clone)]
pub struct UrlFetcher {
    client: reqwest::Client,
    max_size: u64,
}

impl UrlFetcher {
    pub fn new(config: &UploadConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.url_fetch_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            max_size: config.max_upload_size as u64,
        })
    }

    /// Turns a remote source into a local one. Other sources pass through untouched.
    pub async fn fetch(&self, source: UploadSource) -> Result<UploadSource, ApiError> {
        match source {
            UploadSource::RemoteUrl(url) => Ok(UploadSource::LocalFile(self.download(&url).await?)),
            other => Ok(other),
        }
    }

    async fn download(&self, url: &Url) -> Result<TempUpload, ApiError> {
        tracing::info!(url = %url, "Fetching upload from URL");

        let request_error = |e: reqwest::Error| {
            tracing::warn!(url = %url, error = %e, "URL fetch failed");
            ApiError::client("http-request-error", format!("HTTP request failed: {}", e))
        };

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(request_error)?;
        if !response.status().is_success() {
            return Err(ApiError::client(
                "http-bad-status",
                format!("There was a problem during the HTTP request: {}", response.status()),
            ));
        }

        let temp = NamedTempFile::new()
            .map_err(|e| ApiError::internal(format!("Failed to create temp file: {}", e)))?;
        let mut out = tokio::fs::File::create(temp.path())
            .await
            .map_err(|e| ApiError::internal(format!("Failed to open temp file: {}", e)))?;

        let mut size: u64 = 0;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(request_error)?;
            size += chunk.len() as u64;
            if size > self.max_size {
                return Err(ApiError::new(
                    ErrorKind::FatalContent,
                    "file-too-large",
                    format!("The file is bigger than the maximum of {} bytes", self.max_size),
                ));
            }
            out.write_all(&chunk)
                .await
                .map_err(|e| ApiError::internal(format!("Failed to write temp file: {}", e)))?;
        }
        out.flush()
            .await
            .map_err(|e| ApiError::internal(format!("Failed to write temp file: {}", e)))?;

        tracing::info!(url = %url, size, "Fetched upload from URL");
        Ok(TempUpload { file: temp, size })
    }
}
