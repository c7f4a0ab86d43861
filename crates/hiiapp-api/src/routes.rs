use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, patch, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use hiiapp_gateway::LocalStore;

use crate::identity::IdentityService;
use crate::middleware::{require_api_key, require_auth};
use crate::{auth, documents};

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub identity: IdentityService,
    pub store: LocalStore,
    /// When set, every request must carry it in `x-api-key`.
    pub api_key: Option<String>,
}

pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/federated", post(auth::federated))
        .route("/auth/challenge", post(auth::challenge))
        .route("/auth/phone/request", post(auth::phone_request))
        .route("/auth/phone/confirm", post(auth::phone_confirm))
        // token is checked by the handler before the upgrade
        .route("/subscribe", get(documents::subscribe));

    let protected_routes = Router::new()
        .route("/auth/me", get(auth::me))
        .route("/auth/profile", patch(auth::update_profile))
        .route(
            "/documents/{*path}",
            get(documents::get_document).put(documents::set_document),
        )
        .route("/query", post(documents::run_query))
        .route("/commit", post(documents::commit))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use hiiapp_db::Database;
    use hiiapp_gateway::dispatcher::Dispatcher;

    use crate::identity::{IdentityConfig, MemoryCodeSender};

    fn app(api_key: Option<&str>) -> Router {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let identity = IdentityService::new(
            db.clone(),
            IdentityConfig::new("test-secret"),
            Arc::new(MemoryCodeSender::new()),
        );
        router(Arc::new(AppStateInner {
            identity,
            store: LocalStore::new(db, Dispatcher::new()),
            api_key: api_key.map(str::to_string),
        }))
    }

    fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    async fn register(app: &Router, email: &str) -> String {
        let (status, body) = send(
            app,
            json_request("POST", "/auth/register", None, json!({"email": email, "password": "secret1"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn register_and_login() {
        let app = app(None);
        register(&app, "x@example.com").await;

        let (status, body) = send(
            &app,
            json_request("POST", "/auth/login", None, json!({"email": "x@example.com", "password": "wrong12"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "auth/wrong-password");

        let (status, body) = send(
            &app,
            json_request("POST", "/auth/login", None, json!({"email": "x@example.com", "password": "secret1"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["email"], "x@example.com");
    }

    #[tokio::test]
    async fn protected_routes_need_a_token() {
        let app = app(None);
        let (status, body) = send(&app, json_request("POST", "/query", None, json!({"collection": "chats"}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unauthenticated");
    }

    #[tokio::test]
    async fn commit_then_read_documents() {
        let app = app(None);
        let token = register(&app, "x@example.com").await;

        let writes = json!({"writes": [{
            "op": "create",
            "path": "chats/c1",
            "fields": {
                "users": {"kind": "value", "value": ["u1", "u2"]},
                "lastMessageTime": {"kind": "server_timestamp"}
            }
        }]});
        let (status, _) = send(&app, json_request("POST", "/commit", Some(&token), writes.clone())).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, json_request("POST", "/commit", Some(&token), writes)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "already-exists");

        let query = json!({
            "collection": "chats",
            "filters": [{"field": "users", "op": "array-contains", "value": "u2"}]
        });
        let (status, body) = send(&app, json_request("POST", "/query", Some(&token), query)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["documents"][0]["id"], "c1");

        let get = Request::builder()
            .uri("/documents/chats/missing")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, get).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_null());
    }

    #[tokio::test]
    async fn api_key_is_enforced_when_configured() {
        let app = app(Some("k1"));
        let body = json!({"email": "x@example.com", "password": "secret1"});

        let (status, _) = send(&app, json_request("POST", "/auth/register", None, body.clone())).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let mut req = json_request("POST", "/auth/register", None, body);
        req.headers_mut().insert("x-api-key", "k1".parse().unwrap());
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::CREATED);
    }
}
