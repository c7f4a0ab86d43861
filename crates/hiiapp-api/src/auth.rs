use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use tracing::error;

use hiiapp_types::api::{
    AuthSession, AuthUser, Claims, FederatedCredential, LoginRequest, PhoneCodeRequest,
    PhoneConfirmRequest, ProfileUpdate, RegisterRequest, VerificationHandle,
};
use hiiapp_types::challenge::ChallengeTicket;
use hiiapp_types::error::AuthError;

use crate::error::ApiError;
use crate::identity::IdentityService;
use crate::routes::AppState;

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = with_identity(&state, move |identity| identity.register(&req)).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthSession>, ApiError> {
    with_identity(&state, move |identity| identity.sign_in(&req))
        .await
        .map(Json)
}

pub async fn federated(
    State(state): State<AppState>,
    Json(credential): Json<FederatedCredential>,
) -> Result<Json<AuthSession>, ApiError> {
    with_identity(&state, move |identity| identity.sign_in_federated(&credential))
        .await
        .map(Json)
}

pub async fn challenge(State(state): State<AppState>) -> Result<Json<ChallengeTicket>, ApiError> {
    with_identity(&state, |identity| identity.issue_challenge())
        .await
        .map(Json)
}

pub async fn phone_request(
    State(state): State<AppState>,
    Json(req): Json<PhoneCodeRequest>,
) -> Result<Json<VerificationHandle>, ApiError> {
    with_identity(&state, move |identity| identity.request_phone_code(&req))
        .await
        .map(Json)
}

pub async fn phone_confirm(
    State(state): State<AppState>,
    Json(req): Json<PhoneConfirmRequest>,
) -> Result<Json<AuthSession>, ApiError> {
    with_identity(&state, move |identity| identity.confirm_phone_code(&req))
        .await
        .map(Json)
}

pub async fn me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<AuthUser>, ApiError> {
    with_identity(&state, move |identity| identity.user(&claims.sub))
        .await
        .map(Json)
}

pub async fn update_profile(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(update): Json<ProfileUpdate>,
) -> Result<Json<AuthUser>, ApiError> {
    with_identity(&state, move |identity| identity.update_profile(&claims.sub, &update))
        .await
        .map(Json)
}

/// Identity calls hash passwords and hit SQLite, so they run off the
/// async runtime.
async fn with_identity<F, T>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&IdentityService) -> Result<T, AuthError> + Send + 'static,
    T: Send + 'static,
{
    let identity = state.identity.clone();
    let result = tokio::task::spawn_blocking(move || f(&identity))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            AuthError::Internal(e.to_string())
        })?;
    Ok(result?)
}
