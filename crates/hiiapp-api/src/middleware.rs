use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use hiiapp_types::error::{AuthError, StoreError};

use crate::error::ApiError;
use crate::routes::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Extract and validate the session token from the Authorization header.
/// The decoded [`hiiapp_types::api::Claims`] are stored as a request
/// extension.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StoreError::Unauthenticated)?;

    let claims = state
        .identity
        .verify_token(token)
        .map_err(|_: AuthError| StoreError::Unauthenticated)?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

/// Reject requests without the configured API key. A server started
/// without a key accepts everything.
pub async fn require_api_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = state.api_key.as_deref() {
        let given = req
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok());
        if given != Some(expected) {
            return Err(StoreError::PermissionDenied("invalid API key".into()).into());
        }
    }
    Ok(next.run(req).await)
}
