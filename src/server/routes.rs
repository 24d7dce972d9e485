//! Axum router setup and terminal-facing handlers.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap};
use axum::middleware;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde_json::{json, Value};
use std::io::Read;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use super::auth::{auth_middleware, AuthContext};
use super::config::ServerConfig;
use super::error::ServerError;
use super::ingest;
use super::store::ServerStore;
use crate::protocol::{
    SyncRequest, SyncRequestedFlag, SyncResponse, HEALTH_PATH, SYNC_PATH,
    SYNC_REQUESTED_CLEAR_PATH, SYNC_REQUESTED_PATH,
};

#[derive(Clone)]
pub struct AppState {
    pub store: ServerStore,
    pub max_decompressed_bytes: usize,
}

pub fn build_router(store: ServerStore, config: &ServerConfig) -> Router {
    let state = AppState {
        store,
        max_decompressed_bytes: config.max_decompressed_bytes,
    };

    let authenticated = Router::new()
        .route(SYNC_PATH, post(sync))
        .route(SYNC_REQUESTED_PATH, get(sync_requested))
        .route(SYNC_REQUESTED_CLEAR_PATH, post(clear_sync_requested))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let public = Router::new().route(HEALTH_PATH, get(health));

    Router::new()
        .merge(authenticated)
        .merge(public)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Undo `Content-Encoding: zstd` when present.
fn decode_body(headers: &HeaderMap, body: Bytes, limit: usize) -> Result<Vec<u8>, ServerError> {
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase());
    match encoding.as_deref() {
        None | Some("") | Some("identity") => Ok(body.to_vec()),
        Some("zstd") => {
            let decoder = zstd::stream::read::Decoder::new(&body[..])
                .map_err(|e| ServerError::BadRequest(format!("invalid zstd body: {e}")))?;
            let mut out = Vec::new();
            decoder
                .take(limit as u64 + 1)
                .read_to_end(&mut out)
                .map_err(|e| ServerError::BadRequest(format!("invalid zstd body: {e}")))?;
            if out.len() > limit {
                return Err(ServerError::PayloadTooLarge);
            }
            Ok(out)
        }
        Some(other) => Err(ServerError::BadRequest(format!(
            "unsupported content encoding {other}"
        ))),
    }
}

async fn sync(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SyncResponse>, ServerError> {
    let raw = decode_body(&headers, body, state.max_decompressed_bytes)?;
    let request: SyncRequest = serde_json::from_slice(&raw)
        .map_err(|e| ServerError::BadRequest(format!("invalid sync request: {e}")))?;

    let store = state.store.clone();
    let response = tokio::task::spawn_blocking(move || {
        ingest::ingest_batch(&store, &ctx, &request)
    })
    .await
    .map_err(|e| ServerError::Internal(format!("ingest task failed: {e}")))??;

    Ok(Json(response))
}

async fn sync_requested(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<SyncRequestedFlag>, ServerError> {
    let sync_requested = state.store.sync_requested(&ctx.terminal_id)?;
    Ok(Json(SyncRequestedFlag { sync_requested }))
}

async fn clear_sync_requested(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Value>, ServerError> {
    state.store.clear_sync_requested(&ctx.terminal_id)?;
    Ok(Json(json!({ "success": true })))
}
