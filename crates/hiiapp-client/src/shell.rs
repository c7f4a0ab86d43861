//! Top-level layout: picks the screen from the session and owns the
//! directory and the open thread while someone is signed in.

use tracing::{debug, info};

use crate::backend::{DataStore, IdentityProvider};
use crate::directory::{ConversationDirectory, SearchOutcome};
use crate::error::ClientError;
use crate::session::Session;
use crate::thread::ConversationThread;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Loading,
    SignedOut,
    SignedIn,
}

pub struct Shell<I: IdentityProvider, S: DataStore> {
    session: Session<I, S>,
    directory: Option<ConversationDirectory<S>>,
    thread: Option<ConversationThread<S>>,
    selected: Option<String>,
    /// Banner set by directory operations.
    error: Option<String>,
}

impl<I: IdentityProvider, S: DataStore> Shell<I, S> {
    pub fn new(session: Session<I, S>) -> Self {
        let mut shell = Self {
            session,
            directory: None,
            thread: None,
            selected: None,
            error: None,
        };
        shell.sync();
        shell
    }

    pub fn session(&self) -> &Session<I, S> {
        &self.session
    }

    /// Bring the owned components in line with the session: open the
    /// directory for the signed-in identity, tear everything down otherwise.
    /// Call after any session change.
    pub fn sync(&mut self) {
        match self.session.user() {
            Some(user) => {
                let stale = self.directory.as_ref().is_some_and(|d| d.me() != user.uid);
                if stale {
                    self.teardown();
                }
                if self.directory.is_none() {
                    info!("Opening conversation directory for {}", user.uid);
                    self.directory = Some(ConversationDirectory::open(self.session.store().clone(), user.uid));
                }
            }
            None => {
                if self.directory.is_some() {
                    self.teardown();
                }
            }
        }
    }

    /// Current screen. Syncs first, so a session that changed in the
    /// background (e.g. restored after the bootstrap cutoff) is picked up.
    pub fn screen(&mut self) -> Screen {
        self.sync();
        let state = self.session.state();
        if state.initial_loading {
            Screen::Loading
        } else if state.user.is_some() {
            Screen::SignedIn
        } else {
            Screen::SignedOut
        }
    }

    pub fn directory(&self) -> Option<&ConversationDirectory<S>> {
        self.directory.as_ref()
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// The open thread, hidden while the banner is showing.
    pub fn thread(&self) -> Option<&ConversationThread<S>> {
        if self.error.is_some() {
            return None;
        }
        self.thread.as_ref()
    }

    /// The banner, else the directory's own load failure.
    pub fn error(&self) -> Option<String> {
        self.error
            .clone()
            .or_else(|| self.directory.as_ref().and_then(|d| d.view().error))
    }

    pub fn dismiss_error(&mut self) {
        self.error = None;
    }

    /// Unmount the current thread and mount the conversation `id`.
    pub fn select_conversation(&mut self, id: impl Into<String>) -> Result<(), ClientError> {
        let id = id.into();
        let me = self.session.user().ok_or(ClientError::NotSignedIn)?.uid;
        if self.selected.as_deref() == Some(id.as_str()) && self.thread.is_some() {
            return Ok(());
        }
        self.thread = None;
        debug!("Selecting conversation {}", id);
        self.thread = Some(ConversationThread::open(self.session.store().clone(), id.clone(), me));
        self.selected = Some(id);
        Ok(())
    }

    /// Search by address. An existing conversation is selected directly;
    /// failures go to the banner.
    pub async fn search(&mut self, address: &str) -> Result<Option<SearchOutcome>, ClientError> {
        self.error = None;
        let directory = self.directory.as_ref().ok_or(ClientError::NotSignedIn)?;
        match directory.search(address).await {
            Ok(Some(SearchOutcome::Existing(id))) => {
                self.select_conversation(id.clone())?;
                Ok(Some(SearchOutcome::Existing(id)))
            }
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Create (or reuse) the conversation with `counterpart` and select it.
    pub async fn start_conversation(&mut self, counterpart: &str) -> Result<String, ClientError> {
        self.error = None;
        let directory = self.directory.as_ref().ok_or(ClientError::NotSignedIn)?;
        match directory.start_conversation(counterpart).await {
            Ok(id) => {
                self.select_conversation(id.clone())?;
                Ok(id)
            }
            Err(e) => {
                self.error = Some(e.to_string());
                Err(e)
            }
        }
    }

    pub async fn sign_out(&mut self) -> Result<(), ClientError> {
        self.teardown();
        self.session.sign_out().await
    }

    fn teardown(&mut self) {
        self.thread = None;
        self.selected = None;
        self.directory = None;
        self.error = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use hiiapp_api::identity::{IdentityConfig, MemoryCodeSender};
    use hiiapp_db::Database;

    use super::*;
    use crate::credentials::CredentialCache;
    use crate::local::{LocalBackend, LocalIdentity};
    use hiiapp_gateway::LocalStore;

    async fn shell() -> Shell<LocalIdentity, LocalStore> {
        let backend = LocalBackend::open(
            Arc::new(Database::open_in_memory().unwrap()),
            IdentityConfig::new("test-secret"),
            Arc::new(MemoryCodeSender::new()),
            CredentialCache::in_memory(),
        )
        .await;
        let session = Session::start(backend.identity, backend.store, Duration::from_secs(2)).await;
        Shell::new(session)
    }

    #[tokio::test]
    async fn screens_follow_the_session() {
        let mut shell = shell().await;
        assert_eq!(shell.screen(), Screen::SignedOut);
        assert!(shell.directory().is_none());

        shell
            .session()
            .sign_up_with_email("x@example.com", "secret1", "X")
            .await
            .unwrap();
        shell.sync();
        assert_eq!(shell.screen(), Screen::SignedIn);
        assert!(shell.directory().is_some());

        shell.sign_out().await.unwrap();
        assert_eq!(shell.screen(), Screen::SignedOut);
        assert!(shell.directory().is_none());
    }

    #[tokio::test]
    async fn search_errors_hide_the_thread() {
        let mut shell = shell().await;
        shell
            .session()
            .sign_up_with_email("x@example.com", "secret1", "X")
            .await
            .unwrap();
        shell.sync();
        shell.select_conversation("some-chat").unwrap();
        assert!(shell.thread().is_some());

        let err = shell.search("nobody@example.com").await.unwrap_err();
        assert_eq!(err, ClientError::UserNotFound);
        assert_eq!(shell.error().as_deref(), Some("User not found"));
        assert!(shell.thread().is_none());

        shell.dismiss_error();
        assert!(shell.thread().is_some());
    }

    #[tokio::test]
    async fn screen_opens_the_directory_for_a_late_sign_in() {
        let mut shell = shell().await;
        shell
            .session()
            .sign_up_with_email("x@example.com", "secret1", "X")
            .await
            .unwrap();

        assert_eq!(shell.screen(), Screen::SignedIn);
        let directory = shell.directory().unwrap();
        assert_eq!(Some(directory.me().to_string()), shell.session().user().map(|u| u.uid));
    }

    #[tokio::test]
    async fn selecting_requires_a_user() {
        let mut shell = shell().await;
        assert_eq!(shell.select_conversation("c1"), Err(ClientError::NotSignedIn));
    }
}
