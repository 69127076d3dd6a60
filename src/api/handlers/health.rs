use crate::AppState;
use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
    pub storage: String,
    pub uploads_enabled: bool,
    pub version: String,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "System health status", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_status = if state.db.ping().await.is_ok() {
        "connected"
    } else {
        "disconnected"
    };

    let storage = state.upload_service.stash().storage();
    let storage_status = match storage.file_exists("health-check").await {
        Ok(_) => "connected",
        Err(e) => {
            tracing::warn!("Storage health check failed: {}", e);
            "disconnected"
        }
    };

    let status = if db_status == "connected" && storage_status == "connected" {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        database: db_status.to_string(),
        storage: storage_status.to_string(),
        uploads_enabled: state.config.enable_uploads,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
