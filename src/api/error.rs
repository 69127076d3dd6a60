use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::models::StatusError;
use crate::services::stash::StashError;

/// Error classes a failed upload request falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad, missing or conflicting parameters
    Client,
    /// The user can fix it (usually by picking another name)
    RecoverableContent,
    /// The content can never be accepted
    FatalContent,
    Permission,
    Unauthorized,
    RateLimited,
    Storage,
    /// Offset mismatch or a request against a session in the wrong state
    Consistency,
    Internal,
}

#[derive(Error, Debug, Clone)]
#[error("{code}: {info}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub code: String,
    pub info: String,
    /// Extra fields merged at the root of the error object
    pub data: Map<String, Value>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, code: impl Into<String>, info: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            info: info.into(),
            data: Map::new(),
        }
    }

    pub fn client(code: impl Into<String>, info: impl Into<String>) -> Self {
        Self::new(ErrorKind::Client, code, info)
    }

    pub fn bad_params(info: impl Into<String>) -> Self {
        Self::client("badparams", info)
    }

    pub fn missing_param(name: &str) -> Self {
        Self::client(
            format!("missingparam-{}", name),
            format!("The \"{}\" parameter must be set.", name),
        )
    }

    pub fn permission(code: impl Into<String>, info: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, code, info)
    }

    pub fn unauthorized(info: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, "badtoken", info)
    }

    pub fn stash_failed(info: impl Into<String>) -> Self {
        Self::new(ErrorKind::Consistency, "stashfailed", info)
    }

    pub fn internal(info: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, "internal_api_error", info)
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Marks an error the client can fix by changing one parameter.
    pub fn with_invalid_parameter(self, param: &str) -> Self {
        self.with_data("invalidparameter", param)
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind == ErrorKind::RecoverableContent
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind {
            ErrorKind::Client
            | ErrorKind::RecoverableContent
            | ErrorKind::FatalContent
            | ErrorKind::Consistency => StatusCode::BAD_REQUEST,
            ErrorKind::Permission => StatusCode::FORBIDDEN,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Storage | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Form persisted into a session so a later status check can replay the failure.
    pub fn to_status_error(&self) -> StatusError {
        StatusError {
            code: self.code.clone(),
            info: self.info.clone(),
            data: self.data.clone(),
        }
    }

    pub fn from_status_error(status: &StatusError) -> Self {
        let kind = if status.data.contains_key("invalidparameter") {
            ErrorKind::RecoverableContent
        } else {
            ErrorKind::FatalContent
        };
        Self {
            kind,
            code: status.code.clone(),
            info: status.info.clone(),
            data: status.data.clone(),
        }
    }

    pub fn to_json(&self) -> Value {
        let mut error = Map::new();
        error.insert("code".to_string(), Value::String(self.code.clone()));
        error.insert("info".to_string(), Value::String(self.info.clone()));
        for (key, value) in &self.data {
            error.insert(key.clone(), value.clone());
        }
        json!({ "error": error })
    }
}

impl From<StashError> for ApiError {
    fn from(err: StashError) -> Self {
        let kind = match &err {
            StashError::NotLoggedIn | StashError::WrongOwner { .. } => ErrorKind::Permission,
            StashError::NoSuchKey(_) | StashError::NotFound(_) | StashError::BadKey(_) => {
                ErrorKind::Client
            }
            StashError::ZeroLength => ErrorKind::FatalContent,
            StashError::Storage(_) | StashError::Other { .. } => ErrorKind::Storage,
        };
        let info = match &err {
            StashError::Other { type_name, message } => format!("{}: {}", type_name, message),
            other => other.to_string(),
        };
        Self::new(kind, err.code(), info)
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(err: sea_orm::DbErr) -> Self {
        tracing::error!("Database error: {:?}", err);
        Self::internal("Database error")
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("Internal error: {:?}", err);
        Self::internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self.kind, ErrorKind::Storage | ErrorKind::Internal) {
            tracing::error!(code = %self.code, "{}", self.info);
        }
        (self.status_code(), Json(self.to_json())).into_response()
    }
}
