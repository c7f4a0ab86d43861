//! In-process backend: the embedded store and identity service behind the
//! client traits.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use hiiapp_api::identity::{CodeSender, IdentityConfig, IdentityService};
use hiiapp_db::Database;
use hiiapp_gateway::LocalStore;
use hiiapp_gateway::dispatcher::Dispatcher;
use hiiapp_types::api::{
    AuthSession, AuthUser, FederatedCredential, LoginRequest, PhoneCodeRequest, PhoneConfirmRequest,
    ProfileUpdate, RegisterRequest, VerificationHandle,
};
use hiiapp_types::challenge::{ChallengeSolution, ChallengeTicket};
use hiiapp_types::error::{AuthError, StoreError};
use hiiapp_types::store::{DocPath, Document, Fields, Query, Write};
use hiiapp_types::subscription::Subscription;

use crate::backend::{AuthState, DataStore, IdentityProvider, SnapshotItem};
use crate::credentials::CredentialCache;

impl DataStore for LocalStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError> {
        LocalStore::get(self, path).await
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        LocalStore::query(self, query).await
    }

    async fn set_merge(&self, path: &DocPath, fields: Fields) -> Result<(), StoreError> {
        LocalStore::set_merge(self, path, fields).await.map(|_| ())
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        LocalStore::commit(self, writes).await.map(|_| ())
    }

    fn subscribe(&self, query: Query) -> Subscription<SnapshotItem> {
        LocalStore::subscribe(self, query)
    }
}

/// [`IdentityProvider`] over an in-process [`IdentityService`].
#[derive(Clone)]
pub struct LocalIdentity {
    service: IdentityService,
    credentials: Arc<CredentialCache>,
    state: Arc<watch::Sender<AuthState>>,
}

impl LocalIdentity {
    /// Restores a persisted session when its token is still valid.
    pub async fn start(service: IdentityService, credentials: CredentialCache) -> Self {
        let credentials = Arc::new(credentials);
        let mut current = None;

        if let Some(session) = credentials.load().await {
            let svc = service.clone();
            let token = session.token.clone();
            let restored = tokio::task::spawn_blocking(move || {
                let claims = svc.verify_token(&token)?;
                svc.user(&claims.sub)
            })
            .await;
            match restored {
                Ok(Ok(user)) => {
                    info!("Restored session for {}", user.uid);
                    credentials.update_user(user.clone()).await;
                    current = Some(user);
                }
                _ => {
                    warn!("Stored session is no longer valid, discarding");
                    credentials.clear().await;
                }
            }
        }

        let (state, _) = watch::channel(Ok(current));
        Self {
            service,
            credentials,
            state: Arc::new(state),
        }
    }

    pub fn service(&self) -> &IdentityService {
        &self.service
    }

    pub fn credentials(&self) -> &CredentialCache {
        &self.credentials
    }

    async fn call<T, F>(&self, f: F) -> Result<T, AuthError>
    where
        F: FnOnce(&IdentityService) -> Result<T, AuthError> + Send + 'static,
        T: Send + 'static,
    {
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || f(&service))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                AuthError::Internal(e.to_string())
            })?
    }

    async fn establish(&self, session: AuthSession) -> AuthUser {
        self.credentials.store(&session).await;
        let user = session.user;
        self.state.send_modify(|s| *s = Ok(Some(user.clone())));
        user
    }
}

impl IdentityProvider for LocalIdentity {
    async fn sign_in_with_federated(&self, credential: FederatedCredential) -> Result<AuthUser, AuthError> {
        let session = self
            .call(move |service| service.sign_in_federated(&credential))
            .await?;
        Ok(self.establish(session).await)
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthUser, AuthError> {
        let req = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let session = self.call(move |service| service.sign_in(&req)).await?;
        Ok(self.establish(session).await)
    }

    async fn register_with_password(&self, email: &str, password: &str) -> Result<AuthUser, AuthError> {
        let req = RegisterRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let session = self.call(move |service| service.register(&req)).await?;
        Ok(self.establish(session).await)
    }

    async fn update_profile(&self, update: ProfileUpdate) -> Result<AuthUser, AuthError> {
        let uid = self
            .credentials
            .current()
            .map(|session| session.user.uid)
            .ok_or(AuthError::InvalidCredential)?;
        let user = self
            .call(move |service| service.update_profile(&uid, &update))
            .await?;
        self.credentials.update_user(user.clone()).await;
        self.state.send_modify(|s| *s = Ok(Some(user.clone())));
        Ok(user)
    }

    async fn issue_challenge(&self) -> Result<ChallengeTicket, AuthError> {
        self.call(|service| service.issue_challenge()).await
    }

    async fn request_phone_code(
        &self,
        phone_number: &str,
        solution: ChallengeSolution,
    ) -> Result<VerificationHandle, AuthError> {
        let req = PhoneCodeRequest {
            phone_number: phone_number.to_string(),
            challenge: solution,
        };
        self.call(move |service| service.request_phone_code(&req)).await
    }

    async fn confirm_phone_code(&self, handle: &VerificationHandle, code: &str) -> Result<AuthUser, AuthError> {
        let req = PhoneConfirmRequest {
            verification_id: handle.verification_id.clone(),
            code: code.to_string(),
        };
        let session = self.call(move |service| service.confirm_phone_code(&req)).await?;
        Ok(self.establish(session).await)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        debug!("Signing out");
        self.credentials.clear().await;
        self.state.send_modify(|s| *s = Ok(None));
        Ok(())
    }

    fn auth_state(&self) -> Subscription<AuthState> {
        Subscription::from_watch(self.state.subscribe())
    }
}

/// Store and identity provider sharing one database.
#[derive(Clone)]
pub struct LocalBackend {
    pub store: LocalStore,
    pub identity: LocalIdentity,
}

impl LocalBackend {
    pub async fn open(
        db: Arc<Database>,
        config: IdentityConfig,
        code_sender: Arc<dyn CodeSender>,
        credentials: CredentialCache,
    ) -> Self {
        let store = LocalStore::new(db.clone(), Dispatcher::new());
        let service = IdentityService::new(db, config, code_sender);
        let identity = LocalIdentity::start(service, credentials).await;
        Self { store, identity }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hiiapp_api::identity::MemoryCodeSender;

    async fn backend(credentials: CredentialCache) -> LocalBackend {
        LocalBackend::open(
            Arc::new(Database::open_in_memory().unwrap()),
            IdentityConfig::new("test-secret"),
            Arc::new(MemoryCodeSender::new()),
            credentials,
        )
        .await
    }

    #[tokio::test]
    async fn sign_in_publishes_auth_state() {
        let backend = backend(CredentialCache::in_memory()).await;
        let mut states = backend.identity.auth_state();
        assert_eq!(states.next().await, Some(Ok(None)));

        let user = backend
            .identity
            .register_with_password("x@example.com", "secret1")
            .await
            .unwrap();
        assert_eq!(states.next().await, Some(Ok(Some(user))));

        backend.identity.sign_out().await.unwrap();
        assert_eq!(states.next().await, Some(Ok(None)));
    }

    #[tokio::test]
    async fn update_profile_requires_a_session() {
        let backend = backend(CredentialCache::in_memory()).await;
        let result = backend.identity.update_profile(ProfileUpdate::default()).await;
        assert_eq!(result, Err(AuthError::InvalidCredential));
    }
}
