use thiserror::Error;

/// Failures reported by the document store. Each variant has a stable code
/// that travels over the wire in [`crate::api::ErrorBody`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("document already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("request is not authenticated")]
    Unauthenticated,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not-found",
            Self::AlreadyExists(_) => "already-exists",
            Self::InvalidArgument(_) => "invalid-argument",
            Self::Unauthenticated => "unauthenticated",
            Self::PermissionDenied(_) => "permission-denied",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "internal",
        }
    }

    pub fn from_code(code: &str, message: String) -> Self {
        match code {
            "not-found" => Self::NotFound(message),
            "already-exists" => Self::AlreadyExists(message),
            "invalid-argument" => Self::InvalidArgument(message),
            "unauthenticated" => Self::Unauthenticated,
            "permission-denied" => Self::PermissionDenied(message),
            "unavailable" => Self::Unavailable(message),
            _ => Self::Internal(message),
        }
    }
}

/// Identity provider failures, keyed by the provider's error code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no account exists for this address")]
    UserNotFound,
    #[error("the password is invalid")]
    WrongPassword,
    #[error("the address is already registered")]
    EmailAlreadyInUse,
    #[error("the address is malformed")]
    InvalidEmail,
    #[error("the password is too weak")]
    WeakPassword,
    #[error("the phone number is malformed")]
    InvalidPhoneNumber,
    #[error("the verification code is invalid")]
    InvalidVerificationCode,
    #[error("the verification code has expired")]
    CodeExpired,
    #[error("no pending phone verification")]
    MissingVerification,
    #[error("challenge verification failed")]
    ChallengeFailed,
    #[error("the credential is invalid or expired")]
    InvalidCredential,
    /// Rejected by local form validation before reaching the provider.
    #[error("{0}")]
    Validation(&'static str),
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
    #[error("internal identity error: {0}")]
    Internal(String),
    #[error("{code}: {message}")]
    Other { code: String, message: String },
}

impl AuthError {
    pub fn code(&self) -> &str {
        match self {
            Self::UserNotFound => "auth/user-not-found",
            Self::WrongPassword => "auth/wrong-password",
            Self::EmailAlreadyInUse => "auth/email-already-in-use",
            Self::InvalidEmail => "auth/invalid-email",
            Self::WeakPassword => "auth/weak-password",
            Self::InvalidPhoneNumber => "auth/invalid-phone-number",
            Self::InvalidVerificationCode => "auth/invalid-verification-code",
            Self::CodeExpired => "auth/code-expired",
            Self::MissingVerification => "auth/missing-verification-id",
            Self::ChallengeFailed => "auth/captcha-check-failed",
            Self::InvalidCredential => "auth/invalid-credential",
            Self::Validation(_) => "auth/argument-error",
            Self::Unavailable(_) => "auth/network-request-failed",
            Self::Internal(_) => "auth/internal-error",
            Self::Other { code, .. } => code.as_str(),
        }
    }

    pub fn from_code(code: &str, message: String) -> Self {
        match code {
            "auth/user-not-found" => Self::UserNotFound,
            "auth/wrong-password" => Self::WrongPassword,
            "auth/email-already-in-use" => Self::EmailAlreadyInUse,
            "auth/invalid-email" => Self::InvalidEmail,
            "auth/weak-password" => Self::WeakPassword,
            "auth/invalid-phone-number" => Self::InvalidPhoneNumber,
            "auth/invalid-verification-code" => Self::InvalidVerificationCode,
            "auth/code-expired" => Self::CodeExpired,
            "auth/missing-verification-id" => Self::MissingVerification,
            "auth/captcha-check-failed" => Self::ChallengeFailed,
            "auth/invalid-credential" => Self::InvalidCredential,
            "auth/network-request-failed" => Self::Unavailable(message),
            "auth/internal-error" => Self::Internal(message),
            _ => Self::Other {
                code: code.to_string(),
                message,
            },
        }
    }

    /// Message shown to the user. Codes outside the fixed table get the
    /// generic fallback.
    pub fn user_message(&self) -> &str {
        match self {
            Self::UserNotFound => "No account found with this email",
            Self::WrongPassword => "Incorrect password",
            Self::EmailAlreadyInUse => "Email is already registered",
            Self::InvalidPhoneNumber => "Invalid phone number format",
            Self::InvalidVerificationCode => "Invalid OTP",
            Self::WeakPassword => "Password should be at least 6 characters",
            Self::MissingVerification => "Please request OTP first",
            Self::Validation(message) => *message,
            _ => "An error occurred during authentication",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_round_trip() {
        for err in [
            AuthError::UserNotFound,
            AuthError::WrongPassword,
            AuthError::EmailAlreadyInUse,
            AuthError::InvalidPhoneNumber,
            AuthError::InvalidVerificationCode,
            AuthError::WeakPassword,
            AuthError::ChallengeFailed,
        ] {
            assert_eq!(AuthError::from_code(err.code(), String::new()), err);
        }
    }

    #[test]
    fn user_messages_follow_fixed_table() {
        assert_eq!(AuthError::UserNotFound.user_message(), "No account found with this email");
        assert_eq!(AuthError::WeakPassword.user_message(), "Password should be at least 6 characters");
        assert_eq!(AuthError::InvalidVerificationCode.user_message(), "Invalid OTP");
    }

    #[test]
    fn unknown_codes_fall_back_to_generic_message() {
        let err = AuthError::from_code("auth/too-many-requests", "slow down".into());
        assert_eq!(err.code(), "auth/too-many-requests");
        assert_eq!(err.user_message(), "An error occurred during authentication");
    }

    #[test]
    fn store_codes_round_trip() {
        let err = StoreError::AlreadyExists("chats/c1".into());
        assert_eq!(StoreError::from_code(err.code(), "chats/c1".into()), err);
        assert_eq!(
            StoreError::from_code("something-new", "x".into()),
            StoreError::Internal("x".into())
        );
    }
}
