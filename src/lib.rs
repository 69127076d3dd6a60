pub mod api;
pub mod config;
pub mod entities;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

use crate::config::UploadConfig;
use crate::services::upload_service::UploadService;
use axum::{
    Router,
    http::HeaderValue,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::upload::upload,
        api::handlers::health::health_check,
    ),
    components(
        schemas(
            models::UploadParams,
            models::UploadResponse,
            models::UploadResult,
            models::UploadStage,
            models::WatchlistMode,
            models::FileInfo,
            api::handlers::health::HealthResponse,
        )
    ),
    tags(
        (name = "upload", description = "File upload endpoints"),
        (name = "system", description = "Service status")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub config: Arc<UploadConfig>,
    pub upload_service: UploadService,
}

fn cors_layer(config: &UploadConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any)
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .route(
            "/upload",
            post(api::handlers::upload::upload)
                .layer(axum::extract::DefaultBodyLimit::max(
                    state.config.max_upload_size + 10 * 1024 * 1024, // multipart overhead
                ))
                .layer(from_fn_with_state(
                    state.clone(),
                    api::middleware::auth::auth_middleware,
                )),
        )
        .layer(cors_layer(&state.config))
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .with_state(state)
}
