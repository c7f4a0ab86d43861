use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::challenge::ChallengeSolution;
use crate::store::{Fields, Write};

// -- JWT Claims --

/// Session token claims, shared by the HTTP middleware, the WebSocket
/// subscription endpoint and the in-process identity adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Claims carried by an id token from a federated identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatedClaims {
    pub iss: String,
    pub sub: String,
    pub exp: usize,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

// -- Identity --

/// The authenticated identity as the provider knows it. The chat profile in
/// the `users` collection is derived from this on every sign-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub photo_url: Option<String>,
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSession {
    pub token: String,
    pub user: AuthUser,
}

// -- Auth requests --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FederatedCredential {
    /// Issuer name the id token was minted by (e.g. `google`).
    pub provider: String,
    pub id_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhoneCodeRequest {
    pub phone_number: String,
    pub challenge: ChallengeSolution,
}

/// Returned by the first phone sign-in phase, required by the second.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationHandle {
    pub verification_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhoneConfirmRequest {
    pub verification_id: String,
    pub code: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileUpdate {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub photo_url: Option<String>,
}

// -- Documents --

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetDocumentRequest {
    pub fields: Fields,
    #[serde(default)]
    pub merge: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommitRequest {
    pub writes: Vec<Write>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommitResponse {
    pub update_time: DateTime<Utc>,
}

// -- Errors --

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}
