//! Client for a `hiiapp-server`: HTTP for requests, one WebSocket per
//! subscription.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};

use hiiapp_api::middleware::API_KEY_HEADER;
use hiiapp_types::api::{
    AuthSession, AuthUser, CommitRequest, CommitResponse, ErrorBody, FederatedCredential,
    LoginRequest, PhoneCodeRequest, PhoneConfirmRequest, ProfileUpdate, RegisterRequest,
    SetDocumentRequest, VerificationHandle,
};
use hiiapp_types::challenge::{ChallengeSolution, ChallengeTicket};
use hiiapp_types::error::{AuthError, StoreError};
use hiiapp_types::events::SubscriptionFrame;
use hiiapp_types::store::{DocPath, Document, Fields, Query, Snapshot, Write};
use hiiapp_types::subscription::{SUBSCRIPTION_BUFFER, Subscription};

use crate::backend::{AuthState, DataStore, IdentityProvider, SnapshotItem};
use crate::config::ClientConfig;
use crate::credentials::CredentialCache;

/// Why a request failed: the server answered with an error body, or it
/// could not be reached.
#[derive(Debug)]
enum Failure {
    Api(ErrorBody),
    Transport(String),
}

impl From<Failure> for AuthError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Api(body) => AuthError::from_code(&body.code, body.message),
            Failure::Transport(message) => AuthError::Unavailable(message),
        }
    }
}

impl From<Failure> for StoreError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Api(body) => StoreError::from_code(&body.code, body.message),
            Failure::Transport(message) => StoreError::Unavailable(message),
        }
    }
}

#[derive(Clone)]
pub struct RemoteBackend {
    inner: Arc<RemoteInner>,
}

struct RemoteInner {
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    api_key: Option<String>,
    credentials: CredentialCache,
    state: watch::Sender<AuthState>,
}

impl RemoteBackend {
    /// Connect to the backend named by `auth_domain` and restore a persisted
    /// session. A session the server rejects is discarded; one that cannot
    /// be checked because the server is unreachable is kept.
    pub async fn connect(config: &ClientConfig) -> Self {
        let base_url = config.platform.backend_url();
        let ws_url = match base_url.strip_prefix("https://") {
            Some(rest) => format!("wss://{}", rest),
            None => format!("ws://{}", base_url.trim_start_matches("http://")),
        };
        let api_key = Some(config.platform.api_key.clone()).filter(|k| !k.is_empty());
        let credentials = match &config.session_file {
            Some(path) => CredentialCache::file(path.clone()),
            None => CredentialCache::in_memory(),
        };
        let (state, _) = watch::channel(Ok(None));

        let backend = Self {
            inner: Arc::new(RemoteInner {
                http: reqwest::Client::new(),
                base_url,
                ws_url,
                api_key,
                credentials,
                state,
            }),
        };
        backend.restore().await;
        info!("Remote backend at {}", backend.inner.base_url);
        backend
    }

    async fn restore(&self) {
        let Some(session) = self.inner.credentials.load().await else {
            return;
        };
        match self.send::<AuthUser>(self.request(Method::GET, "/auth/me")).await {
            Ok(user) => {
                debug!("Restored session for {}", user.uid);
                self.inner.credentials.update_user(user.clone()).await;
                self.inner.state.send_modify(|s| *s = Ok(Some(user)));
            }
            Err(Failure::Transport(e)) => {
                warn!("Could not revalidate session, keeping it: {}", e);
                self.inner.state.send_modify(|s| *s = Ok(Some(session.user)));
            }
            Err(Failure::Api(body)) => {
                warn!("Stored session rejected ({}), discarding", body.code);
                self.inner.credentials.clear().await;
            }
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut req = self
            .inner
            .http
            .request(method, format!("{}{}", self.inner.base_url, path));
        if let Some(key) = &self.inner.api_key {
            req = req.header(API_KEY_HEADER, key);
        }
        if let Some(token) = self.inner.credentials.token() {
            req = req.bearer_auth(token);
        }
        req
    }

    fn post<B: Serialize>(&self, path: &str, body: &B) -> RequestBuilder {
        self.request(Method::POST, path).json(body)
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, Failure> {
        let response = req.send().await.map_err(|e| Failure::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| Failure::Transport(e.to_string()));
        }

        let body = match response.json::<ErrorBody>().await {
            Ok(body) => body,
            // Rejections outside the handlers (e.g. malformed JSON) have no
            // error body
            Err(_) => ErrorBody {
                code: fallback_code(status).to_string(),
                message: status.to_string(),
            },
        };
        Err(Failure::Api(body))
    }

    async fn establish(&self, session: AuthSession) -> AuthUser {
        self.inner.credentials.store(&session).await;
        let user = session.user;
        self.inner.state.send_modify(|s| *s = Ok(Some(user.clone())));
        user
    }
}

fn fallback_code(status: StatusCode) -> &'static str {
    match status {
        StatusCode::UNAUTHORIZED => "unauthenticated",
        StatusCode::FORBIDDEN => "permission-denied",
        StatusCode::NOT_FOUND => "not-found",
        StatusCode::CONFLICT => "already-exists",
        s if s.is_server_error() => "unavailable",
        _ => "invalid-argument",
    }
}

impl IdentityProvider for RemoteBackend {
    async fn sign_in_with_federated(&self, credential: FederatedCredential) -> Result<AuthUser, AuthError> {
        let session: AuthSession = self.send(self.post("/auth/federated", &credential)).await?;
        Ok(self.establish(session).await)
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthUser, AuthError> {
        let body = LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let session: AuthSession = self.send(self.post("/auth/login", &body)).await?;
        Ok(self.establish(session).await)
    }

    async fn register_with_password(&self, email: &str, password: &str) -> Result<AuthUser, AuthError> {
        let body = RegisterRequest {
            email: email.to_string(),
            password: password.to_string(),
        };
        let session: AuthSession = self.send(self.post("/auth/register", &body)).await?;
        Ok(self.establish(session).await)
    }

    async fn update_profile(&self, update: ProfileUpdate) -> Result<AuthUser, AuthError> {
        if self.inner.credentials.token().is_none() {
            return Err(AuthError::InvalidCredential);
        }
        let user: AuthUser = self
            .send(self.request(Method::PATCH, "/auth/profile").json(&update))
            .await?;
        self.inner.credentials.update_user(user.clone()).await;
        self.inner.state.send_modify(|s| *s = Ok(Some(user.clone())));
        Ok(user)
    }

    async fn issue_challenge(&self) -> Result<ChallengeTicket, AuthError> {
        Ok(self.send(self.request(Method::POST, "/auth/challenge")).await?)
    }

    async fn request_phone_code(
        &self,
        phone_number: &str,
        solution: ChallengeSolution,
    ) -> Result<VerificationHandle, AuthError> {
        let body = PhoneCodeRequest {
            phone_number: phone_number.to_string(),
            challenge: solution,
        };
        Ok(self.send(self.post("/auth/phone/request", &body)).await?)
    }

    async fn confirm_phone_code(&self, handle: &VerificationHandle, code: &str) -> Result<AuthUser, AuthError> {
        let body = PhoneConfirmRequest {
            verification_id: handle.verification_id.clone(),
            code: code.to_string(),
        };
        let session: AuthSession = self.send(self.post("/auth/phone/confirm", &body)).await?;
        Ok(self.establish(session).await)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.inner.credentials.clear().await;
        self.inner.state.send_modify(|s| *s = Ok(None));
        Ok(())
    }

    fn auth_state(&self) -> Subscription<AuthState> {
        Subscription::from_watch(self.inner.state.subscribe())
    }
}

impl DataStore for RemoteBackend {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError> {
        let path = format!("/documents/{}", path);
        Ok(self.send(self.request(Method::GET, &path)).await?)
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let snapshot: Snapshot = self.send(self.post("/query", query)).await?;
        Ok(snapshot.documents)
    }

    async fn set_merge(&self, path: &DocPath, fields: Fields) -> Result<(), StoreError> {
        let body = SetDocumentRequest { fields, merge: true };
        let path = format!("/documents/{}", path);
        let _: CommitResponse = self.send(self.request(Method::PUT, &path).json(&body)).await?;
        Ok(())
    }

    async fn commit(&self, writes: Vec<Write>) -> Result<(), StoreError> {
        let body = CommitRequest { writes };
        let _: CommitResponse = self.send(self.post("/commit", &body)).await?;
        Ok(())
    }

    fn subscribe(&self, query: Query) -> Subscription<SnapshotItem> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let inner = self.inner.clone();
        let producer = tokio::spawn(async move {
            let collection = query.collection.clone();
            if let Err(e) = stream_query(&inner, query, &tx).await {
                warn!("Subscription to {} ended: {}", collection, e);
                let _ = tx.send(Err(e)).await;
            }
        });
        Subscription::new(rx, &producer)
    }
}

/// Forward snapshot frames until the receiver goes away. A dropped
/// connection is reported as `Unavailable`; nothing reconnects.
async fn stream_query(
    inner: &RemoteInner,
    query: Query,
    tx: &mpsc::Sender<SnapshotItem>,
) -> Result<(), StoreError> {
    let unavailable = |e: tokio_tungstenite::tungstenite::Error| StoreError::Unavailable(e.to_string());

    let token = inner.credentials.token().ok_or(StoreError::Unauthenticated)?;
    let mut request = format!("{}/subscribe?access_token={}", inner.ws_url, token)
        .into_client_request()
        .map_err(|e| StoreError::InvalidArgument(e.to_string()))?;
    if let Some(key) = &inner.api_key {
        let value = HeaderValue::from_str(key).map_err(|e| StoreError::InvalidArgument(e.to_string()))?;
        request.headers_mut().insert(API_KEY_HEADER, value);
    }

    let (socket, _) = connect_async(request).await.map_err(unavailable)?;
    let (mut sink, mut stream) = socket.split();

    let text = serde_json::to_string(&query).map_err(|e| StoreError::Internal(e.to_string()))?;
    sink.send(Message::Text(text.into())).await.map_err(unavailable)?;
    debug!("Subscribed to {}", query.collection);

    while let Some(msg) = stream.next().await {
        match msg.map_err(unavailable)? {
            Message::Text(text) => {
                let frame: SubscriptionFrame =
                    serde_json::from_str(&text).map_err(|e| StoreError::Internal(e.to_string()))?;
                match frame {
                    SubscriptionFrame::Snapshot(snapshot) => {
                        if tx.send(Ok(snapshot)).await.is_err() {
                            return Ok(());
                        }
                    }
                    SubscriptionFrame::Error(body) => {
                        return Err(StoreError::from_code(&body.code, body.message));
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    Err(StoreError::Unavailable("subscription closed by server".into()))
}
