use std::future::Future;

use hiiapp_types::api::{AuthUser, FederatedCredential, ProfileUpdate, VerificationHandle};
use hiiapp_types::challenge::{ChallengeSolution, ChallengeTicket};
use hiiapp_types::error::{AuthError, StoreError};
use hiiapp_types::store::{DocPath, Document, Fields, Query, Snapshot, Write};
use hiiapp_types::subscription::Subscription;

/// Item of an auth-state stream: the current identity, or a terminal error.
pub type AuthState = Result<Option<AuthUser>, AuthError>;

/// Item of a query subscription. An error ends the subscription.
pub type SnapshotItem = Result<Snapshot, StoreError>;

/// Document persistence with realtime queries.
pub trait DataStore: Clone + Send + Sync + 'static {
    fn get(&self, path: &DocPath) -> impl Future<Output = Result<Option<Document>, StoreError>> + Send;

    /// One-shot query.
    fn query(&self, query: &Query) -> impl Future<Output = Result<Vec<Document>, StoreError>> + Send;

    /// Upsert that only replaces the named top-level fields.
    fn set_merge(&self, path: &DocPath, fields: Fields) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Apply all writes atomically or none of them.
    fn commit(&self, writes: Vec<Write>) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Live query: the full result set now and after every change.
    fn subscribe(&self, query: Query) -> Subscription<SnapshotItem>;
}

/// Authentication backend. Successful sign-ins also publish the identity on
/// [`IdentityProvider::auth_state`].
pub trait IdentityProvider: Clone + Send + Sync + 'static {
    fn sign_in_with_federated(
        &self,
        credential: FederatedCredential,
    ) -> impl Future<Output = Result<AuthUser, AuthError>> + Send;

    fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> impl Future<Output = Result<AuthUser, AuthError>> + Send;

    fn register_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> impl Future<Output = Result<AuthUser, AuthError>> + Send;

    /// Update the signed-in identity's profile.
    fn update_profile(&self, update: ProfileUpdate) -> impl Future<Output = Result<AuthUser, AuthError>> + Send;

    /// Human-interaction challenge required before a phone code is sent.
    fn issue_challenge(&self) -> impl Future<Output = Result<ChallengeTicket, AuthError>> + Send;

    fn request_phone_code(
        &self,
        phone_number: &str,
        solution: ChallengeSolution,
    ) -> impl Future<Output = Result<VerificationHandle, AuthError>> + Send;

    fn confirm_phone_code(
        &self,
        handle: &VerificationHandle,
        code: &str,
    ) -> impl Future<Output = Result<AuthUser, AuthError>> + Send;

    fn sign_out(&self) -> impl Future<Output = Result<(), AuthError>> + Send;

    /// The current identity now and after every change.
    fn auth_state(&self) -> Subscription<AuthState>;
}
