use crate::AppState;
use crate::api::error::ApiError;
use crate::models::{UploadParams, UploadResponse, WatchlistMode};
use crate::services::identity::Identity;
use crate::services::source::{TempUpload, UploadRequest};
use axum::{
    Extension, Json,
    extract::{Multipart, State, multipart::Field},
};
use tokio::io::AsyncWriteExt;
use validator::Validate;

#[utoipa::path(
    post,
    path = "/upload",
    request_body(content = Multipart, description = "Upload parameters, with a `file` or `chunk` payload"),
    responses(
        (status = 200, description = "Upload processed", body = UploadResponse),
        (status = 400, description = "Bad parameters or rejected content"),
        (status = 401, description = "Invalid token"),
        (status = 403, description = "Permission denied"),
        (status = 500, description = "Storage or internal failure")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "upload"
)]
pub async fn upload(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let request = match read_request(&mut multipart).await {
        Ok(request) => request,
        Err(e) => {
            // Drain the rest of the body so the client sees the error instead of a reset
            tracing::warn!("Upload rejected while reading the form: {}", e);
            while let Ok(Some(mut field)) = multipart.next_field().await {
                while let Ok(Some(_)) = field.chunk().await {}
            }
            return Err(e);
        }
    };

    request.params.validate().map_err(|e| {
        ApiError::client("toomanyvalues", format!("Invalid parameters: {}", e))
            .with_data("param", "tags")
    })?;

    let response = state.upload_service.upload(&identity, request).await?;
    Ok(Json(response))
}

async fn read_request(multipart: &mut Multipart) -> Result<UploadRequest, ApiError> {
    let mut request = UploadRequest::default();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        let err_msg = e.to_string();
        if err_msg.contains("length limit exceeded") {
            ApiError::client("file-too-large", "Request body exceeds the maximum allowed limit")
        } else {
            ApiError::client("badupload", err_msg)
        }
    })? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => request.file = Some(spool_to_temp(field).await?),
            "chunk" => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::client("badupload", e.to_string()))?;
                request.chunk = Some(data);
            }
            _ => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::client("badupload", e.to_string()))?;
                apply_param(&mut request.params, &name, value)?;
            }
        }
    }

    Ok(request)
}

/// Writes a `file` part to a temporary file, counting its bytes.
async fn spool_to_temp(mut field: Field<'_>) -> Result<TempUpload, ApiError> {
    let file = tempfile::NamedTempFile::new()
        .map_err(|e| ApiError::internal(format!("Failed to create temp file: {}", e)))?;
    let handle = file
        .reopen()
        .map_err(|e| ApiError::internal(format!("Failed to open temp file: {}", e)))?;
    let mut writer = tokio::fs::File::from_std(handle);

    let mut size = 0u64;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| ApiError::client("badupload", e.to_string()))?
    {
        size += chunk.len() as u64;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| ApiError::internal(format!("Failed to spool upload: {}", e)))?;
    }
    writer
        .flush()
        .await
        .map_err(|e| ApiError::internal(format!("Failed to spool upload: {}", e)))?;

    Ok(TempUpload { file, size })
}

/// Sets one scalar form field. Unknown fields are ignored.
pub fn apply_param(params: &mut UploadParams, name: &str, value: String) -> Result<(), ApiError> {
    match name {
        "filename" => params.filename = Some(value),
        "comment" => params.comment = value,
        "text" => params.text = Some(value),
        "tags" | "tags[]" => params.tags.extend(
            value
                .split('|')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        ),
        "watchlist" => {
            params.watchlist = value.parse::<WatchlistMode>().map_err(|e| {
                ApiError::client("badvalue", e).with_data("param", "watchlist")
            })?
        }
        "watch" => params.watch = parse_bool(&value),
        "ignorewarnings" => params.ignorewarnings = parse_bool(&value),
        "url" => params.url = non_empty(value),
        "filekey" => params.filekey = non_empty(value),
        "sessionkey" => params.sessionkey = non_empty(value),
        "stash" => params.stash = parse_bool(&value),
        "filesize" => params.filesize = Some(parse_integer("filesize", &value)?),
        "offset" => params.offset = Some(parse_integer("offset", &value)?),
        "async" => params.async_mode = parse_bool(&value),
        "checkstatus" => params.checkstatus = parse_bool(&value),
        other => tracing::debug!(param = %other, "Ignoring unrecognized upload parameter"),
    }
    Ok(())
}

/// A flag counts as set when present, unless it is spelled as an explicit false.
fn parse_bool(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}

fn parse_integer(name: &str, value: &str) -> Result<u64, ApiError> {
    value.trim().parse::<u64>().map_err(|_| {
        ApiError::client(
            "badinteger",
            format!("Invalid value \"{}\" for integer parameter \"{}\".", value, name),
        )
        .with_data("param", name)
    })
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_accept_repeats_and_pipes() {
        let mut params = UploadParams::default();
        apply_param(&mut params, "tags", "a|b".to_string()).unwrap();
        apply_param(&mut params, "tags[]", "c".to_string()).unwrap();
        assert_eq!(params.tags, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_flags_and_integers() {
        let mut params = UploadParams::default();
        apply_param(&mut params, "stash", "".to_string()).unwrap();
        apply_param(&mut params, "async", "1".to_string()).unwrap();
        apply_param(&mut params, "ignorewarnings", "false".to_string()).unwrap();
        apply_param(&mut params, "offset", "2000".to_string()).unwrap();
        assert!(params.stash);
        assert!(params.async_mode);
        assert!(!params.ignorewarnings);
        assert_eq!(params.offset, Some(2000));

        let err = apply_param(&mut params, "filesize", "-5".to_string()).unwrap_err();
        assert_eq!(err.code, "badinteger");
    }

    #[test]
    fn test_watchlist_and_empty_keys() {
        let mut params = UploadParams::default();
        apply_param(&mut params, "watchlist", "nochange".to_string()).unwrap();
        apply_param(&mut params, "filekey", "".to_string()).unwrap();
        assert_eq!(params.watchlist, WatchlistMode::NoChange);
        assert!(params.filekey.is_none());
        assert!(apply_param(&mut params, "watchlist", "always".to_string()).is_err());
    }
}
