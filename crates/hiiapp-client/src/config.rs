use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// How long [`crate::session::Session::start`] waits for the first auth event.
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Backend platform settings. All six values are opaque to the client
/// except `auth_domain`, which is the backend origin.
#[derive(Clone, PartialEq, Eq)]
pub struct PlatformConfig {
    pub api_key: String,
    pub auth_domain: String,
    pub project_id: String,
    pub storage_bucket: String,
    pub messaging_sender_id: String,
    pub app_id: String,
}

impl PlatformConfig {
    /// Read from the environment after loading `.env` if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &'static str| lookup(name).ok_or(ConfigError::Missing(name));
        let config = Self {
            api_key: var("HIIAPP_API_KEY")?,
            auth_domain: var("HIIAPP_AUTH_DOMAIN")?,
            project_id: var("HIIAPP_PROJECT_ID")?,
            storage_bucket: var("HIIAPP_STORAGE_BUCKET")?,
            messaging_sender_id: var("HIIAPP_MESSAGING_SENDER_ID")?,
            app_id: var("HIIAPP_APP_ID")?,
        };
        if config.auth_domain.trim().is_empty() {
            return Err(ConfigError::Invalid {
                name: "HIIAPP_AUTH_DOMAIN",
                reason: "must not be empty".into(),
            });
        }
        debug!("Loaded platform config: {:?}", config);
        Ok(config)
    }

    /// HTTP origin of the backend. A bare host gets `http://`.
    pub fn backend_url(&self) -> String {
        let domain = self.auth_domain.trim().trim_end_matches('/');
        if domain.starts_with("http://") || domain.starts_with("https://") {
            domain.to_string()
        } else {
            format!("http://{}", domain)
        }
    }
}

impl fmt::Debug for PlatformConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformConfig")
            .field("api_key", &"***")
            .field("auth_domain", &self.auth_domain)
            .field("project_id", &self.project_id)
            .field("storage_bucket", &self.storage_bucket)
            .field("messaging_sender_id", &self.messaging_sender_id)
            .field("app_id", &self.app_id)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub platform: PlatformConfig,
    pub bootstrap_timeout: Duration,
    /// Where the signed-in session is persisted. `None` keeps it in memory.
    pub session_file: Option<PathBuf>,
}

impl ClientConfig {
    pub fn new(platform: PlatformConfig) -> Self {
        Self {
            platform,
            bootstrap_timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
            session_file: None,
        }
    }

    /// Platform values plus the optional `HIIAPP_SESSION_FILE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new(PlatformConfig::from_env()?);
        config.session_file = std::env::var("HIIAPP_SESSION_FILE").ok().map(PathBuf::from);
        Ok(config)
    }
}
