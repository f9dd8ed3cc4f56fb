use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use base64::Engine;
use tracing::info;

use crate::server::error::ApiError;
use crate::shared::models::AppState;

/// Fixed basic-auth username; the password is the shared secret.
pub const AUTH_USERNAME: &str = "kswings";

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    let encoded = header.strip_prefix("Basic ").ok_or(ApiError::Unauthorized)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or(ApiError::Unauthorized)?;

    let (user, pass) = decoded.split_once(':').ok_or(ApiError::Unauthorized)?;
    if user != AUTH_USERNAME || pass != state.config.key {
        return Err(ApiError::Unauthorized);
    }

    info!(
        method = %request.method(),
        path = %request.uri().path(),
        "API request"
    );

    Ok(next.run(request).await)
}
