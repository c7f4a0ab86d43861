#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use hiiapp_api::identity::{IdentityConfig, MemoryCodeSender};
use hiiapp_client::credentials::CredentialCache;
use hiiapp_client::local::{LocalBackend, LocalIdentity};
use hiiapp_db::Database;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn test_config() -> IdentityConfig {
    let mut config = IdentityConfig::new("integration-secret");
    config.challenge_difficulty = 4;
    config
}

pub async fn local_backend(codes: Arc<MemoryCodeSender>) -> LocalBackend {
    LocalBackend::open(
        Arc::new(Database::open_in_memory().unwrap()),
        test_config(),
        codes,
        CredentialCache::in_memory(),
    )
    .await
}

/// A second identity signed in against the same backend.
pub async fn second_identity(backend: &LocalBackend) -> LocalIdentity {
    LocalIdentity::start(backend.identity.service().clone(), CredentialCache::in_memory()).await
}

/// Wait until the watched value satisfies `pred`, then return a copy of it.
pub async fn wait_until<T: Clone>(mut rx: watch::Receiver<T>, pred: impl FnMut(&T) -> bool) -> T {
    tokio::time::timeout(WAIT, rx.wait_for(pred))
        .await
        .expect("timed out waiting for state")
        .expect("state sender dropped")
        .clone()
}
