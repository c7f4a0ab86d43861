use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use hiiapp_api::identity::{IdentityConfig, IdentityService, LogCodeSender};
use hiiapp_api::{AppState, AppStateInner, router};
use hiiapp_gateway::LocalStore;
use hiiapp_gateway::dispatcher::Dispatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hiiapp=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("HIIAPP_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("HIIAPP_DB_PATH").unwrap_or_else(|_| "hiiapp.db".into());
    let host = std::env::var("HIIAPP_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("HIIAPP_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let api_key = std::env::var("HIIAPP_API_KEY").ok().filter(|k| !k.is_empty());

    let mut identity_config = IdentityConfig::new(jwt_secret);
    if let Ok(issuers) = std::env::var("HIIAPP_FEDERATED_ISSUERS") {
        identity_config.federated_issuers = parse_issuers(&issuers)?;
    }
    if let Ok(difficulty) = std::env::var("HIIAPP_CHALLENGE_DIFFICULTY") {
        identity_config.challenge_difficulty = difficulty
            .parse()
            .context("HIIAPP_CHALLENGE_DIFFICULTY must be a number")?;
    }
    if api_key.is_none() {
        warn!("HIIAPP_API_KEY not set, requests are not checked for an API key");
    }
    info!(
        "Federated issuers: {:?}",
        identity_config.federated_issuers.keys().collect::<Vec<_>>()
    );

    // Init database
    let db = Arc::new(hiiapp_db::Database::open(&PathBuf::from(&db_path))?);

    // Shared state
    let state: AppState = Arc::new(AppStateInner {
        identity: IdentityService::new(db.clone(), identity_config, Arc::new(LogCodeSender)),
        store: LocalStore::new(db, Dispatcher::new()),
        api_key,
    });

    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("hiiapp server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// `name=secret,name=secret`
fn parse_issuers(raw: &str) -> anyhow::Result<HashMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (name, secret) = entry
                .split_once('=')
                .with_context(|| format!("federated issuer entry without '=': {}", entry))?;
            Ok((name.trim().to_string(), secret.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issuers_parse() {
        let issuers = parse_issuers("google=abc, github=def,").unwrap();
        assert_eq!(issuers.get("google").map(String::as_str), Some("abc"));
        assert_eq!(issuers.get("github").map(String::as_str), Some("def"));
        assert!(parse_issuers("broken").is_err());
    }
}
