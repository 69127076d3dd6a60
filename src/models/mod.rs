use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use validator::Validate;

/// Outcome of one upload request, also persisted as the session result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum UploadResult {
    Success,
    Warning,
    Continue,
    Poll,
    Failure,
}

impl UploadResult {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadResult::Success | UploadResult::Failure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UploadResult::Success => "Success",
            UploadResult::Warning => "Warning",
            UploadResult::Continue => "Continue",
            UploadResult::Poll => "Poll",
            UploadResult::Failure => "Failure",
        }
    }
}

impl fmt::Display for UploadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Success" => Ok(UploadResult::Success),
            "Warning" => Ok(UploadResult::Warning),
            "Continue" => Ok(UploadResult::Continue),
            "Poll" => Ok(UploadResult::Poll),
            "Failure" => Ok(UploadResult::Failure),
            other => Err(format!("unknown upload result '{}'", other)),
        }
    }
}

/// Where a multi-request upload currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum UploadStage {
    Uploading,
    Queued,
    Assembling,
    Publish,
    Done,
}

impl UploadStage {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStage::Uploading => "uploading",
            UploadStage::Queued => "queued",
            UploadStage::Assembling => "assembling",
            UploadStage::Publish => "publish",
            UploadStage::Done => "done",
        }
    }
}

impl fmt::Display for UploadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(UploadStage::Uploading),
            "queued" => Ok(UploadStage::Queued),
            "assembling" => Ok(UploadStage::Assembling),
            "publish" => Ok(UploadStage::Publish),
            "done" => Ok(UploadStage::Done),
            other => Err(format!("unknown upload stage '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum WatchlistMode {
    Watch,
    #[default]
    Preferences,
    NoChange,
}

impl FromStr for WatchlistMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "watch" => Ok(WatchlistMode::Watch),
            "preferences" => Ok(WatchlistMode::Preferences),
            "nochange" => Ok(WatchlistMode::NoChange),
            other => Err(format!("unrecognized watchlist value '{}'", other)),
        }
    }
}

/// Scalar parameters of an upload request. The `file` and `chunk` payloads
/// travel next to this struct, see [`crate::services::source::UploadRequest`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, ToSchema)]
pub struct UploadParams {
    pub filename: Option<String>,
    #[serde(default)]
    pub comment: String,
    pub text: Option<String>,
    #[serde(default)]
    #[validate(length(max = 50, message = "Too many tags"))]
    pub tags: Vec<String>,
    #[serde(default)]
    pub watchlist: WatchlistMode,
    /// Deprecated, forces watching
    #[serde(default)]
    pub watch: bool,
    #[serde(default)]
    pub ignorewarnings: bool,
    pub url: Option<String>,
    pub filekey: Option<String>,
    /// Deprecated alias of `filekey`
    pub sessionkey: Option<String>,
    #[serde(default)]
    pub stash: bool,
    pub filesize: Option<u64>,
    pub offset: Option<u64>,
    #[serde(default, rename = "async")]
    pub async_mode: bool,
    #[serde(default)]
    pub checkstatus: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub sha256: String,
    pub mime_type: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A failure persisted into a session so a later status check can replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusError {
    pub code: String,
    pub info: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// Last known outcome details of a session, stored as JSON next to its state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Key of the assembled file once assembly has finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filekey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fileinfo: Option<FileInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StatusError>,
}

/// Persisted state of a multi-request upload, keyed by the filekey the client holds.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadSession {
    pub file_key: String,
    pub user_id: String,
    pub result: UploadResult,
    pub stage: UploadStage,
    pub offset: u64,
    pub file_size: Option<u64>,
    pub status: SessionStatus,
}

impl UploadSession {
    pub fn new(file_key: &str, user_id: &str, result: UploadResult, stage: UploadStage) -> Self {
        Self {
            file_key: file_key.to_string(),
            user_id: user_id.to_string(),
            result,
            stage,
            offset: 0,
            file_size: None,
            status: SessionStatus::default(),
        }
    }

    /// Same session in a new state, progress and declared size carried over.
    pub fn transition(&self, result: UploadResult, stage: UploadStage) -> Self {
        Self {
            result,
            stage,
            ..self.clone()
        }
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_accepting_chunks(&self) -> bool {
        self.result == UploadResult::Continue && self.stage == UploadStage::Uploading
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UploadResponse {
    pub result: UploadResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filekey: Option<String>,
    /// Same value as `filekey`, kept for older clients
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessionkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<UploadStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub warnings: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fileinfo: Option<FileInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stashfailed: Option<String>,
}

impl UploadResponse {
    pub fn new(result: UploadResult) -> Self {
        Self {
            result,
            filekey: None,
            sessionkey: None,
            offset: None,
            stage: None,
            warnings: None,
            filename: None,
            fileinfo: None,
            stashfailed: None,
        }
    }

    pub fn set_filekey(&mut self, key: impl Into<String>) {
        let key = key.into();
        self.sessionkey = Some(key.clone());
        self.filekey = Some(key);
    }
}
