use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{debug, warn};

use hiiapp_types::api::{AuthSession, AuthUser};

/// The signed-in session, kept in memory and optionally mirrored to a JSON
/// file so it survives restarts. File errors are logged and otherwise
/// ignored: losing the file only means signing in again.
pub struct CredentialCache {
    path: Option<PathBuf>,
    current: Mutex<Option<AuthSession>>,
}

impl CredentialCache {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            current: Mutex::new(None),
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            current: Mutex::new(None),
        }
    }

    /// Read the persisted session, if any. Callers revalidate the token
    /// before trusting it.
    pub async fn load(&self) -> Option<AuthSession> {
        let path = self.path.as_ref()?;
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Could not read session file {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_slice::<AuthSession>(&raw) {
            Ok(session) => {
                debug!("Loaded session for {}", session.user.uid);
                self.set(Some(session.clone()));
                Some(session)
            }
            Err(e) => {
                warn!("Discarding corrupt session file {}: {}", path.display(), e);
                self.clear().await;
                None
            }
        }
    }

    pub async fn store(&self, session: &AuthSession) {
        self.set(Some(session.clone()));
        let Some(path) = &self.path else {
            return;
        };
        let result = match serde_json::to_vec_pretty(session) {
            Ok(raw) => tokio::fs::write(path, raw).await,
            Err(e) => Err(std::io::Error::other(e)),
        };
        if let Err(e) = result {
            warn!("Could not persist session to {}: {}", path.display(), e);
        }
    }

    /// Replace the cached user, keeping the token.
    pub async fn update_user(&self, user: AuthUser) {
        let session = self.current().map(|session| AuthSession {
            token: session.token,
            user,
        });
        if let Some(session) = session {
            self.store(&session).await;
        }
    }

    pub async fn clear(&self) {
        self.set(None);
        if let Some(path) = &self.path {
            if let Err(e) = tokio::fs::remove_file(path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Could not remove session file {}: {}", path.display(), e);
                }
            }
        }
    }

    pub fn current(&self) -> Option<AuthSession> {
        self.current.lock().ok().and_then(|current| current.clone())
    }

    pub fn token(&self) -> Option<String> {
        self.current().map(|session| session.token)
    }

    fn set(&self, session: Option<AuthSession>) {
        if let Ok(mut current) = self.current.lock() {
            *current = session;
        }
    }
}
