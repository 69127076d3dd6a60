use crate::AppState;
use crate::api::error::ApiError;
use crate::services::identity::Identity;
use crate::utils::auth::validate_jwt;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use serde::Deserialize;

#[derive(Deserialize)]
struct AuthQuery {
    token: Option<String>,
}

fn extract_token(req: &Request) -> Option<String> {
    let auth_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|s| s.to_string());

    if auth_header.is_some() {
        return auth_header;
    }

    // Try query parameter
    let query = req.uri().query().unwrap_or_default();
    serde_urlencoded::from_str::<AuthQuery>(query)
        .ok()
        .and_then(|q| q.token)
}

/// Resolves the acting [`Identity`]. Requests without a token run anonymously;
/// a token that fails validation or names an unknown user is rejected.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = match extract_token(&req) {
        None => Identity::anonymous(),
        Some(token) => {
            let claims = validate_jwt(&token, &state.config.jwt_secret).map_err(|e| {
                tracing::debug!("Rejected token: {}", e);
                ApiError::unauthorized("Invalid or expired token")
            })?;

            // Check if user still exists in DB
            Identity::load(&state.db, &claims.sub)
                .await?
                .ok_or_else(|| ApiError::unauthorized("Unknown user"))?
        }
    };

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}
