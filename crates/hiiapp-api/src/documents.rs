use axum::{
    Extension, Json,
    extract::{Path, Query as QueryParams, State, WebSocketUpgrade},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use hiiapp_db::documents::CommitResult;
use hiiapp_gateway::connection;
use hiiapp_types::api::{Claims, CommitRequest, CommitResponse, SetDocumentRequest};
use hiiapp_types::error::StoreError;
use hiiapp_types::store::{DocPath, Document, Query, Snapshot, Write};

use crate::error::ApiError;
use crate::routes::AppState;

pub async fn get_document(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Json<Option<Document>>, ApiError> {
    let path = DocPath::parse(&path)?;
    Ok(Json(state.store.get(&path).await?))
}

pub async fn set_document(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(path): Path<String>,
    Json(req): Json<SetDocumentRequest>,
) -> Result<Json<CommitResponse>, ApiError> {
    let path = DocPath::parse(&path)?;
    debug!("{} sets {} (merge: {})", claims.sub, path, req.merge);
    let result = state
        .store
        .commit(vec![Write::Set {
            path,
            fields: req.fields,
            merge: req.merge,
        }])
        .await?;
    commit_response(result)
}

pub async fn run_query(
    State(state): State<AppState>,
    Json(query): Json<Query>,
) -> Result<Json<Snapshot>, ApiError> {
    let documents = state.store.query(&query).await?;
    Ok(Json(Snapshot { documents }))
}

pub async fn commit(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CommitRequest>,
) -> Result<Json<CommitResponse>, ApiError> {
    debug!("{} commits {} write(s)", claims.sub, req.writes.len());
    let result = state.store.commit(req.writes).await?;
    commit_response(result)
}

#[derive(Debug, Deserialize)]
pub struct SubscribeParams {
    access_token: String,
}

/// Browsers cannot set headers on a WebSocket upgrade, so the session token
/// travels as a query parameter and is checked before upgrading.
pub async fn subscribe(
    State(state): State<AppState>,
    QueryParams(params): QueryParams<SubscribeParams>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let claims = state
        .identity
        .verify_token(&params.access_token)
        .map_err(|_| StoreError::Unauthenticated)?;
    let store = state.store.clone();
    Ok(ws.on_upgrade(move |socket| connection::handle_subscription(socket, store, claims.sub)))
}

fn commit_response(result: CommitResult) -> Result<Json<CommitResponse>, ApiError> {
    let update_time = DateTime::<Utc>::from_timestamp_micros(result.update_time)
        .ok_or_else(|| StoreError::Internal(format!("bad commit time {}", result.update_time)))?;
    Ok(Json(CommitResponse { update_time }))
}
