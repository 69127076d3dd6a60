use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;

use crate::api::error::{ApiError, ErrorKind};
use crate::config::UploadConfig;
use crate::services::scanner::{ScanResult, VirusScanner};
use crate::utils::validation::{
    MAX_FILENAME_BYTES, filter_filename, final_extension, is_executable_content,
    is_illegal_filename, split_extensions,
};

const SNIFF_BYTES: usize = 8192;

/// Why a file was refused.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerificationFailure {
    #[error("The filename is too short")]
    FilenameTooShort,

    #[error("The filename is not allowed")]
    IllegalFilename { filtered: String },

    #[error("The filename is too long")]
    FilenameTooLong,

    #[error("The filename is missing an extension")]
    FiletypeMissing,

    #[error("Filenames with non-ASCII characters are not accepted")]
    WindowsNonAsciiFilename,

    #[error("The file you submitted was empty")]
    EmptyFile,

    #[error("The file you submitted was too large")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Filetype not permitted: {}", banned_list(.filetype, .blacklisted))]
    FiletypeBanned {
        filetype: String,
        allowed: Vec<String>,
        blacklisted: Option<Vec<String>>,
    },

    #[error("This file did not pass file verification: {}", .details.join(" "))]
    VerificationError { details: Vec<String> },

    #[error("{details}")]
    HookAborted { details: String },

    #[error("An unknown error occurred")]
    Unknown(String),
}

impl VerificationFailure {
    pub fn code(&self) -> &'static str {
        match self {
            VerificationFailure::FilenameTooShort => "filename-tooshort",
            VerificationFailure::IllegalFilename { .. } => "illegal-filename",
            VerificationFailure::FilenameTooLong => "filename-toolong",
            VerificationFailure::FiletypeMissing => "filetype-missing",
            VerificationFailure::WindowsNonAsciiFilename => "windows-nonascii-filename",
            VerificationFailure::EmptyFile => "empty-file",
            VerificationFailure::FileTooLarge { .. } => "file-too-large",
            VerificationFailure::FiletypeBanned { .. } => "filetype-banned",
            VerificationFailure::VerificationError { .. } => "verification-error",
            VerificationFailure::HookAborted { .. } => "hookaborted",
            VerificationFailure::Unknown(_) => "unknown-error",
        }
    }

    /// Fixable by resubmitting under another file name.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VerificationFailure::FilenameTooShort
                | VerificationFailure::IllegalFilename { .. }
                | VerificationFailure::FilenameTooLong
                | VerificationFailure::FiletypeMissing
                | VerificationFailure::WindowsNonAsciiFilename
        )
    }
}

impl From<VerificationFailure> for ApiError {
    fn from(failure: VerificationFailure) -> Self {
        let info = failure.to_string();
        if failure.is_recoverable() {
            let err = ApiError::new(ErrorKind::RecoverableContent, failure.code(), info)
                .with_invalid_parameter("filename");
            return match failure {
                VerificationFailure::IllegalFilename { filtered } => {
                    err.with_data("filename", filtered)
                }
                _ => err,
            };
        }

        let err = ApiError::new(ErrorKind::FatalContent, failure.code(), info);
        match failure {
            VerificationFailure::FiletypeBanned {
                filetype,
                allowed,
                blacklisted,
            } => {
                let err = err
                    .with_data("filetype", filetype)
                    .with_data("allowed", allowed);
                match blacklisted {
                    Some(list) => err.with_data("blacklisted", list),
                    None => err,
                }
            }
            VerificationFailure::VerificationError { details } => err.with_data("details", details),
            VerificationFailure::HookAborted { details } => err.with_data("details", details),
            VerificationFailure::Unknown(status) => {
                err.with_data("details", json!({ "code": status }))
            }
            _ => err,
        }
    }
}

/// What the pipeline knows about a file that is about to be checked.
#[derive(Debug, Clone)]
pub struct UploadCandidate<'a> {
    pub path: &'a Path,
    pub size: u64,
    pub desired_name: &'a str,
}

/// A file that passed every check.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedFile {
    pub filtered_name: String,
    pub mime_type: Option<String>,
}

/// Site specific acceptance rule, run after the built-in checks.
#[async_trait]
pub trait PolicyCheck: Send + Sync {
    /// `Err` carries the message reported back as `hookaborted`.
    async fn check(&self, candidate: &UploadCandidate<'_>) -> Result<(), String>;
}

#[derive(Clone)]
pub struct VerificationPipeline {
    config: Arc<UploadConfig>,
    scanner: Arc<dyn VirusScanner>,
    policies: Vec<Arc<dyn PolicyCheck>>,
}

impl VerificationPipeline {
    pub fn new(config: Arc<UploadConfig>, scanner: Arc<dyn VirusScanner>) -> Self {
        Self {
            config,
            scanner,
            policies: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn PolicyCheck>) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn check_size(&self, size: u64) -> Result<(), VerificationFailure> {
        if size == 0 {
            return Err(VerificationFailure::EmptyFile);
        }
        let max = self.config.max_upload_size as u64;
        if size > max {
            return Err(VerificationFailure::FileTooLarge { size, max });
        }
        Ok(())
    }

    /// Validates the desired name and returns it in published form.
    pub fn check_name(&self, desired: &str) -> Result<String, VerificationFailure> {
        let filtered = filter_filename(desired);
        if is_illegal_filename(&filtered) {
            return Err(VerificationFailure::IllegalFilename { filtered });
        }

        let (partname, extensions) = split_extensions(&filtered);
        let Some(final_ext) = final_extension(&filtered) else {
            return Err(VerificationFailure::FiletypeMissing);
        };

        self.check_extensions(&extensions, &final_ext)?;

        if self.config.windows_nonascii_restricted && !filtered.is_ascii() {
            return Err(VerificationFailure::WindowsNonAsciiFilename);
        }
        if partname.is_empty() {
            return Err(VerificationFailure::FilenameTooShort);
        }
        if filtered.len() > MAX_FILENAME_BYTES {
            return Err(VerificationFailure::FilenameTooLong);
        }

        Ok(filtered)
    }

    fn check_extensions(
        &self,
        extensions: &[String],
        final_ext: &str,
    ) -> Result<(), VerificationFailure> {
        let blacklisted: Vec<String> = extensions
            .iter()
            .map(|e| e.to_lowercase())
            .filter(|e| self.config.is_prohibited_extension(e))
            .collect();

        let not_allowed = self.config.check_file_extensions
            && self.config.strict_file_extensions
            && !self.config.is_allowed_extension(final_ext);

        if blacklisted.is_empty() && !not_allowed {
            return Ok(());
        }

        let mut allowed = self.config.file_extensions.clone();
        allowed.dedup();
        Err(VerificationFailure::FiletypeBanned {
            filetype: final_ext.to_string(),
            allowed,
            blacklisted: (!blacklisted.is_empty()).then_some(blacklisted),
        })
    }

    /// Runs every check against a complete file on local disk.
    pub async fn verify(
        &self,
        candidate: &UploadCandidate<'_>,
    ) -> Result<VerifiedFile, VerificationFailure> {
        self.check_size(candidate.size)?;
        let filtered_name = self.check_name(candidate.desired_name)?;
        let mime_type = self.check_content(candidate.path, &filtered_name).await?;

        for policy in &self.policies {
            if let Err(details) = policy.check(candidate).await {
                tracing::info!(name = %filtered_name, "Upload rejected by policy: {}", details);
                return Err(VerificationFailure::HookAborted { details });
            }
        }

        Ok(VerifiedFile {
            filtered_name,
            mime_type,
        })
    }

    async fn check_content(
        &self,
        path: &Path,
        filtered_name: &str,
    ) -> Result<Option<String>, VerificationFailure> {
        let header = read_header(path)
            .await
            .map_err(|e| VerificationFailure::Unknown(format!("unreadable file: {}", e)))?;

        if is_executable_content(&header) {
            return Err(verification_error(["uploadscripted"]));
        }

        let detected = infer::get(&header);
        if let (Some(kind), Some(ext)) = (detected, final_extension(filtered_name)) {
            if !extensions_match(kind.extension(), &ext) {
                return Err(verification_error([
                    "filetype-mime-mismatch",
                    ext.as_str(),
                    kind.mime_type(),
                ]));
            }
        }

        if self.config.enable_virus_scan {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| VerificationFailure::Unknown(format!("unreadable file: {}", e)))?;
            match self.scanner.scan(Box::pin(file)).await {
                Ok(ScanResult::Clean) => {}
                Ok(ScanResult::Infected { threat_name }) => {
                    tracing::warn!(name = %filtered_name, threat = %threat_name, "Virus detected in upload");
                    return Err(verification_error(["uploadvirus", threat_name.as_str()]));
                }
                Ok(ScanResult::Error { reason }) => {
                    return Err(verification_error(["virus-scanfailed", reason.as_str()]));
                }
                Err(e) => {
                    let reason = e.to_string();
                    return Err(verification_error(["virus-scanfailed", reason.as_str()]));
                }
            }
        }

        Ok(detected.map(|kind| kind.mime_type().to_string()))
    }
}

fn banned_list(filetype: &str, blacklisted: &Option<Vec<String>>) -> String {
    match blacklisted {
        Some(list) => list.join(", "),
        None => filetype.to_string(),
    }
}

fn verification_error<const N: usize>(details: [&str; N]) -> VerificationFailure {
    VerificationFailure::VerificationError {
        details: details.iter().map(|d| d.to_string()).collect(),
    }
}

fn extensions_match(detected: &str, claimed: &str) -> bool {
    fn canonical(ext: &str) -> &str {
        match ext {
            "jpeg" | "jpe" => "jpg",
            "tif" => "tiff",
            "htm" => "html",
            other => other,
        }
    }
    canonical(detected) == canonical(claimed)
}

async fn read_header(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut header = vec![0u8; SNIFF_BYTES];
    let mut filled = 0;
    while filled < SNIFF_BYTES {
        let n = file.read(&mut header[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    header.truncate(filled);
    Ok(header)
}
