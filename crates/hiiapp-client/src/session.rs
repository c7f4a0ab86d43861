use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use hiiapp_types::api::{AuthUser, FederatedCredential, ProfileUpdate, VerificationHandle};
use hiiapp_types::challenge::ChallengeTicket;
use hiiapp_types::error::{AuthError, StoreError};
use hiiapp_types::models::USERS;
use hiiapp_types::store::{DocPath, Fields};
use hiiapp_types::subscription::Subscription;

use crate::backend::{AuthState, DataStore, IdentityProvider};
use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub user: Option<AuthUser>,
    /// An operation is in flight.
    pub busy: bool,
    /// The first auth-state check has not finished yet.
    pub initial_loading: bool,
    /// User-facing message of the last failure.
    pub error: Option<String>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            user: None,
            busy: false,
            initial_loading: true,
            error: None,
        }
    }
}

/// Two-phase phone sign-in, owned by whoever drives the form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PhoneSignIn {
    #[default]
    AwaitingNumber,
    AwaitingCode {
        phone_number: String,
        handle: VerificationHandle,
        challenge: ChallengeTicket,
    },
}

impl PhoneSignIn {
    pub fn is_awaiting_code(&self) -> bool {
        matches!(self, Self::AwaitingCode { .. })
    }
}

/// Signed-in state of the client. Mirrors every identity it sees into the
/// `users` collection.
pub struct Session<I: IdentityProvider, S: DataStore> {
    provider: I,
    store: S,
    state: watch::Sender<SessionState>,
    listener: JoinHandle<()>,
}

impl<I: IdentityProvider, S: DataStore> Session<I, S> {
    /// Start listening for auth-state changes. Returns once the first event
    /// has been handled, or after `bootstrap_timeout`, whichever is first;
    /// after the timeout the session reads as signed out while the check
    /// keeps running.
    pub async fn start(provider: I, store: S, bootstrap_timeout: Duration) -> Self {
        let (state, _) = watch::channel(SessionState::default());

        info!("Setting up auth listener");
        let listener = tokio::spawn(run_auth_listener(
            provider.auth_state(),
            store.clone(),
            state.clone(),
        ));

        let mut rx = state.subscribe();
        let settled = tokio::time::timeout(bootstrap_timeout, rx.wait_for(|s| !s.initial_loading))
            .await
            .is_ok();
        if !settled {
            warn!("Auth initialization timeout, setting initial_loading to false");
            state.send_modify(|s| s.initial_loading = false);
        }

        Self {
            provider,
            store,
            state,
            listener,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn changes(&self) -> Subscription<SessionState> {
        Subscription::from_watch(self.state.subscribe())
    }

    pub fn user(&self) -> Option<AuthUser> {
        self.state.borrow().user.clone()
    }

    pub fn provider(&self) -> &I {
        &self.provider
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn sign_in_with_federated(&self, credential: FederatedCredential) -> Result<AuthUser, ClientError> {
        self.run(async {
            info!("Starting {} sign-in", credential.provider);
            let user = self.provider.sign_in_with_federated(credential).await?;
            self.establish(user).await
        })
        .await
    }

    pub async fn sign_in_with_email(&self, email: &str, password: &str) -> Result<AuthUser, ClientError> {
        self.run(async {
            require(email, "Email is required")?;
            require(password, "Password is required")?;
            let user = self.provider.sign_in_with_password(email.trim(), password).await?;
            info!("Email sign-in successful: {}", user.uid);
            self.establish(user).await
        })
        .await
    }

    /// Register, then set the display name on the new identity.
    pub async fn sign_up_with_email(&self, email: &str, password: &str, name: &str) -> Result<AuthUser, ClientError> {
        self.run(async {
            require(email, "Email is required")?;
            require(password, "Password is required")?;
            require(name, "Name is required")?;
            let user = self.provider.register_with_password(email.trim(), password).await?;
            info!("Email sign-up successful: {}", user.uid);
            let user = self
                .provider
                .update_profile(ProfileUpdate {
                    display_name: Some(name.trim().to_string()),
                    photo_url: None,
                })
                .await?;
            self.establish(user).await
        })
        .await
    }

    /// First phone phase: solve a fresh challenge and have a code sent.
    pub async fn request_phone_code(&self, flow: &mut PhoneSignIn, phone_number: &str) -> Result<(), ClientError> {
        self.run(async {
            require(phone_number, "Phone number is required")?;
            // A new request always starts over with a new challenge
            *flow = PhoneSignIn::AwaitingNumber;

            let phone_number = normalize_phone(phone_number);
            debug!("Requesting OTP for {}", phone_number);

            let challenge = self.provider.issue_challenge().await?;
            let ticket = challenge.clone();
            let solution = tokio::task::spawn_blocking(move || ticket.solve())
                .await
                .map_err(|e| AuthError::Internal(e.to_string()))?;

            let handle = self.provider.request_phone_code(&phone_number, solution).await?;
            info!("OTP sent successfully");
            *flow = PhoneSignIn::AwaitingCode {
                phone_number,
                handle,
                challenge,
            };
            Ok::<(), ClientError>(())
        })
        .await
    }

    /// Second phone phase. A failed confirmation keeps the flow so the code
    /// can be entered again.
    pub async fn confirm_phone_code(&self, flow: &mut PhoneSignIn, code: &str) -> Result<AuthUser, ClientError> {
        self.run(async {
            require(code, "OTP is required")?;
            let PhoneSignIn::AwaitingCode { handle, .. } = &*flow else {
                return Err(AuthError::MissingVerification.into());
            };

            let user = self.provider.confirm_phone_code(handle, code.trim()).await?;
            info!("OTP verified successfully");
            *flow = PhoneSignIn::AwaitingNumber;
            self.establish(user).await
        })
        .await
    }

    pub async fn sign_out(&self) -> Result<(), ClientError> {
        self.run(async {
            self.provider.sign_out().await?;
            self.state.send_modify(|s| s.user = None);
            Ok::<(), ClientError>(())
        })
        .await
    }

    async fn run<T>(&self, op: impl Future<Output = Result<T, ClientError>>) -> Result<T, ClientError> {
        self.state.send_modify(|s| {
            s.busy = true;
            s.error = None;
            s.initial_loading = false;
        });

        let result = op.await;

        self.state.send_modify(|s| {
            s.busy = false;
            if let Err(e) = &result {
                s.error = Some(e.to_string());
            }
        });
        if let Err(e) = &result {
            error!("Auth operation failed: {:?}", e);
        }
        result
    }

    async fn establish(&self, user: AuthUser) -> Result<AuthUser, ClientError> {
        upsert_profile(&self.store, &user)
            .await
            .map_err(ClientError::ProfileFailed)?;
        self.state.send_modify(|s| s.user = Some(user.clone()));
        Ok(user)
    }
}

impl<I: IdentityProvider, S: DataStore> Drop for Session<I, S> {
    fn drop(&mut self) {
        debug!("Cleaning up auth listener");
        self.listener.abort();
    }
}

fn require(value: &str, message: &'static str) -> Result<(), AuthError> {
    if value.trim().is_empty() {
        Err(AuthError::Validation(message))
    } else {
        Ok(())
    }
}

fn normalize_phone(phone_number: &str) -> String {
    let phone_number = phone_number.trim();
    if phone_number.starts_with('+') {
        phone_number.to_string()
    } else {
        format!("+{}", phone_number)
    }
}

/// Display name for the profile: the provider's, else the address local
/// part, else "Anonymous".
pub fn profile_display_name(user: &AuthUser) -> String {
    user.display_name
        .as_deref()
        .filter(|n| !n.is_empty())
        .or_else(|| {
            user.email
                .as_deref()
                .and_then(|e| e.split('@').next())
                .filter(|local| !local.is_empty())
        })
        .unwrap_or("Anonymous")
        .to_string()
}

/// Merge the identity into its profile document. Unknown fields are left
/// out rather than nulled; `createdAt` is only written on first sight.
pub async fn upsert_profile<S: DataStore>(store: &S, user: &AuthUser) -> Result<(), StoreError> {
    let path = DocPath::new(USERS, &user.uid);
    let exists = store.get(&path).await?.is_some();

    let mut fields = Fields::new()
        .set("displayName", profile_display_name(user))
        .server_timestamp("lastSeen");
    if let Some(email) = &user.email {
        fields = fields.set("email", email.as_str());
    }
    if let Some(photo_url) = &user.photo_url {
        fields = fields.set("photoURL", photo_url.as_str());
    }
    if let Some(phone_number) = &user.phone_number {
        fields = fields.set("phoneNumber", phone_number.as_str());
    }
    if !exists {
        fields = fields.server_timestamp("createdAt");
    }

    debug!("Updating profile of {}", user.uid);
    store.set_merge(&path, fields).await
}

async fn run_auth_listener<S: DataStore>(
    mut auth_state: Subscription<AuthState>,
    store: S,
    state: watch::Sender<SessionState>,
) {
    while let Some(item) = auth_state.next().await {
        match item {
            Ok(Some(user)) => {
                info!("Auth state changed: user logged in: {}", user.uid);
                match upsert_profile(&store, &user).await {
                    Ok(()) => state.send_modify(|s| {
                        s.user = Some(user);
                        s.error = None;
                        s.initial_loading = false;
                    }),
                    Err(e) => {
                        error!("Error updating user data: {}", e);
                        let message = ClientError::ProfileFailed(e).to_string();
                        state.send_modify(|s| {
                            s.error = Some(message);
                            s.initial_loading = false;
                        });
                    }
                }
            }
            Ok(None) => {
                info!("Auth state changed: no user");
                state.send_modify(|s| {
                    s.user = None;
                    s.error = None;
                    s.initial_loading = false;
                });
            }
            Err(e) => {
                error!("Auth state error: {}", e);
                let message = ClientError::from(e).to_string();
                state.send_modify(|s| {
                    s.error = Some(message);
                    s.initial_loading = false;
                });
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::sync::mpsc;

    use hiiapp_db::Database;
    use hiiapp_gateway::LocalStore;
    use hiiapp_gateway::dispatcher::Dispatcher;
    use hiiapp_types::challenge::ChallengeSolution;

    use super::*;

    /// Provider whose auth state stays silent until the test pushes one.
    #[derive(Clone, Default)]
    struct SilentProvider {
        auth_tx: Arc<Mutex<Option<mpsc::Sender<AuthState>>>>,
    }

    impl SilentProvider {
        fn pusher(&self) -> mpsc::Sender<AuthState> {
            self.auth_tx.lock().unwrap().clone().unwrap()
        }
    }

    fn offline<T>() -> Result<T, AuthError> {
        Err(AuthError::Unavailable("offline".into()))
    }

    impl IdentityProvider for SilentProvider {
        async fn sign_in_with_federated(&self, _credential: FederatedCredential) -> Result<AuthUser, AuthError> {
            offline()
        }

        async fn sign_in_with_password(&self, _email: &str, _password: &str) -> Result<AuthUser, AuthError> {
            offline()
        }

        async fn register_with_password(&self, _email: &str, _password: &str) -> Result<AuthUser, AuthError> {
            offline()
        }

        async fn update_profile(&self, _update: ProfileUpdate) -> Result<AuthUser, AuthError> {
            offline()
        }

        async fn issue_challenge(&self) -> Result<ChallengeTicket, AuthError> {
            offline()
        }

        async fn request_phone_code(
            &self,
            _phone_number: &str,
            _solution: ChallengeSolution,
        ) -> Result<VerificationHandle, AuthError> {
            offline()
        }

        async fn confirm_phone_code(&self, _handle: &VerificationHandle, _code: &str) -> Result<AuthUser, AuthError> {
            offline()
        }

        async fn sign_out(&self) -> Result<(), AuthError> {
            Ok(())
        }

        fn auth_state(&self) -> Subscription<AuthState> {
            let (tx, subscription) = Subscription::channel();
            *self.auth_tx.lock().unwrap() = Some(tx);
            subscription
        }
    }

    #[tokio::test(start_paused = true)]
    async fn bootstrap_cutoff_reads_as_signed_out() {
        let provider = SilentProvider::default();
        let store = LocalStore::new(Arc::new(Database::open_in_memory().unwrap()), Dispatcher::new());

        let started = tokio::time::Instant::now();
        let session = Session::start(provider.clone(), store, Duration::from_secs(2)).await;
        assert!(started.elapsed() >= Duration::from_secs(2));

        let state = session.state();
        assert!(!state.initial_loading);
        assert_eq!(state.user, None);

        // The pending check still lands afterwards
        provider.pusher().send(Ok(Some(user(Some("Late"), None)))).await.unwrap();
        let mut rx = session.watch();
        let state = rx.wait_for(|s| s.user.is_some()).await.unwrap().clone();
        assert_eq!(state.user.map(|u| u.uid).as_deref(), Some("u1"));
        assert_eq!(state.error, None);
    }

    fn user(display_name: Option<&str>, email: Option<&str>) -> AuthUser {
        AuthUser {
            uid: "u1".into(),
            email: email.map(str::to_string),
            display_name: display_name.map(str::to_string),
            photo_url: None,
            phone_number: None,
        }
    }

    #[test]
    fn display_name_fallbacks() {
        assert_eq!(profile_display_name(&user(Some("Xavier"), Some("x@example.com"))), "Xavier");
        assert_eq!(profile_display_name(&user(None, Some("x@example.com"))), "x");
        assert_eq!(profile_display_name(&user(Some(""), None)), "Anonymous");
    }

    #[test]
    fn phone_numbers_get_a_plus() {
        assert_eq!(normalize_phone("15550001111"), "+15550001111");
        assert_eq!(normalize_phone(" +15550001111 "), "+15550001111");
    }

    #[test]
    fn validation_messages() {
        let err = ClientError::from(require(" ", "Email is required").unwrap_err());
        assert_eq!(err.to_string(), "Email is required");
        assert_eq!(
            ClientError::from(AuthError::MissingVerification).to_string(),
            "Please request OTP first"
        );
    }
}
