use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use hiiapp_types::api::ErrorBody;
use hiiapp_types::error::{AuthError, StoreError};

/// Handler error. Serialized as `{code, message}` so clients can map the
/// code back to the same error variant.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth(err) => match err {
                AuthError::UserNotFound => StatusCode::NOT_FOUND,
                AuthError::WrongPassword | AuthError::InvalidCredential => StatusCode::UNAUTHORIZED,
                AuthError::EmailAlreadyInUse => StatusCode::CONFLICT,
                AuthError::ChallengeFailed => StatusCode::FORBIDDEN,
                AuthError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
                _ => StatusCode::BAD_REQUEST,
            },
            Self::Store(err) => match err {
                StoreError::NotFound(_) => StatusCode::NOT_FOUND,
                StoreError::AlreadyExists(_) => StatusCode::CONFLICT,
                StoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                StoreError::Unauthenticated => StatusCode::UNAUTHORIZED,
                StoreError::PermissionDenied(_) => StatusCode::FORBIDDEN,
                StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                StoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn body(&self) -> ErrorBody {
        let code = match self {
            Self::Auth(err) => err.code().to_string(),
            Self::Store(err) => err.code().to_string(),
        };
        ErrorBody {
            code,
            message: self.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses() {
        let err = ApiError::from(AuthError::WrongPassword);
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.body().code, "auth/wrong-password");

        let err = ApiError::from(StoreError::AlreadyExists("chats/c1".into()));
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.body().code, "already-exists");
    }
}
