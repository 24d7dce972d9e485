//! Sync server HTTP client.
//!
//! Authenticated communication with the ingestion server: the sync endpoint,
//! the remote "sync requested" flag, and the connectivity probe. Also holds
//! the onboarding helpers for server URLs and connection strings.

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD as BASE64_STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::diagnostics::user_agent;
use crate::protocol::{
    SyncRequest, SyncRequestedFlag, SyncResponse, HEALTH_PATH, SYNC_PATH,
    SYNC_REQUESTED_CLEAR_PATH, SYNC_REQUESTED_PATH, TERMINAL_ID_HEADER,
};
use crate::session::TerminalSession;
use crate::sync::SyncTransport;

/// zstd level used for request bodies.
const COMPRESSION_LEVEL: i32 = 3;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Every variant is a transport failure: the round fails as a whole and the
/// records involved are retried later.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("{0}")]
    Network(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{message} (HTTP {status})")]
    Status { status: u16, message: String },
    #[error("invalid response from sync server: {0}")]
    Decode(String),
    #[error("{0}")]
    Unauthorized(String),
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the sync server URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_server_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

fn connection_string_field(raw: &str, keys: &[&str]) -> Option<String> {
    let payload = decode_connection_string_payload(raw)?;
    keys.iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Pack server URL, token and terminal id into the base64url connection
/// string accepted at onboarding.
pub fn encode_connection_string(server_url: &str, api_key: &str, terminal_id: &str) -> String {
    let payload = serde_json::json!({
        "url": normalize_server_url(server_url),
        "key": api_key,
        "tid": terminal_id,
    });
    URL_SAFE_NO_PAD.encode(payload.to_string())
}

pub fn extract_api_key_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["key"])
}

pub fn extract_server_url_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["url"]).map(|u| normalize_server_url(&u))
}

pub fn extract_terminal_id_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["tid", "terminalId"])
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly error.
fn friendly_error(url: &str, err: &reqwest::Error) -> ApiError {
    if err.is_timeout() {
        return ApiError::Timeout(format!("Connection to {url} timed out"));
    }
    if err.is_connect() {
        return ApiError::Network(format!("Cannot reach sync server at {url}"));
    }
    if err.is_builder() {
        return ApiError::Network(format!("Invalid sync server URL: {url}"));
    }
    if err.is_decode() {
        return ApiError::Decode(err.to_string());
    }
    ApiError::Network(format!("Network error communicating with {url}: {err}"))
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Sync endpoint not found".to_string(),
        413 => "Sync batch too large".to_string(),
        s if s >= 500 => "Sync server error".to_string(),
        _ => "Unexpected response from sync server".to_string(),
    }
}

/// Map a non-success response, preserving the server's `error` message.
fn error_from_body(status: StatusCode, body_text: &str) -> ApiError {
    let message = serde_json::from_str::<Value>(body_text)
        .ok()
        .and_then(|json| {
            json.get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| status_error(status));
    if status == StatusCode::UNAUTHORIZED {
        return ApiError::Unauthorized(message);
    }
    ApiError::Status {
        status: status.as_u16(),
        message,
    }
}

// ---------------------------------------------------------------------------
// Body encoding
// ---------------------------------------------------------------------------

/// Serialize a request body, zstd-compressing it when it exceeds `threshold`.
/// Returns the bytes and whether they are compressed.
pub fn encode_body<T: serde::Serialize>(body: &T, threshold: usize) -> Result<(Vec<u8>, bool), ApiError> {
    let raw = serde_json::to_vec(body).map_err(|e| ApiError::Decode(e.to_string()))?;
    if raw.len() <= threshold {
        return Ok((raw, false));
    }
    let compressed = zstd::encode_all(raw.as_slice(), COMPRESSION_LEVEL)
        .map_err(|e| ApiError::Network(format!("compress request: {e}")))?;
    debug!(
        raw_bytes = raw.len(),
        compressed_bytes = compressed.len(),
        "compressed sync payload"
    );
    Ok((compressed, true))
}

// ---------------------------------------------------------------------------
// HTTP transport
// ---------------------------------------------------------------------------

/// reqwest-backed [`SyncTransport`]. One instance can serve any number of
/// sessions; every call takes the session it acts for.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    connectivity_timeout: Duration,
    compress_threshold: usize,
}

impl HttpTransport {
    pub fn new(config: &SyncConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(user_agent())
            .build()
            .map_err(|e| ApiError::Network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            connectivity_timeout: config.connectivity_timeout,
            compress_threshold: config.compress_threshold_bytes,
        })
    }

    fn bearer(session: &TerminalSession) -> Result<String, ApiError> {
        session
            .token()
            .map(|t| format!("Bearer {}", t.as_str()))
            .ok_or_else(|| ApiError::Unauthorized("terminal is not signed in".into()))
    }

    async fn read_json<T: DeserializeOwned>(
        base: &str,
        resp: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|e| friendly_error(base, &e))?;
        if !status.is_success() {
            return Err(error_from_body(status, &String::from_utf8_lossy(&bytes)));
        }
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// Test connectivity and report latency, for onboarding screens.
    pub async fn test_connectivity(&self, session: &TerminalSession) -> Result<u64, ApiError> {
        let base = session.server_url();
        let start = Instant::now();
        let resp = self
            .client
            .get(format!("{base}{HEALTH_PATH}"))
            .timeout(self.connectivity_timeout)
            .send()
            .await
            .map_err(|e| friendly_error(base, &e))?;
        let latency = start.elapsed().as_millis() as u64;
        if !resp.status().is_success() {
            return Err(ApiError::Status {
                status: resp.status().as_u16(),
                message: status_error(resp.status()),
            });
        }
        info!(latency_ms = latency, "connectivity test passed");
        Ok(latency)
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn is_online(&self, session: &TerminalSession) -> bool {
        let base = session.server_url();
        if base.is_empty() {
            return false;
        }
        match self
            .client
            .head(format!("{base}{HEALTH_PATH}"))
            .timeout(self.connectivity_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "connectivity probe failed");
                false
            }
        }
    }

    async fn sync(
        &self,
        session: &TerminalSession,
        request: &SyncRequest,
    ) -> Result<SyncResponse, ApiError> {
        let base = session.server_url();
        let (body, compressed) = encode_body(request, self.compress_threshold)?;
        let mut req = self
            .client
            .post(format!("{base}{SYNC_PATH}"))
            .header(header::AUTHORIZATION, Self::bearer(session)?)
            .header(TERMINAL_ID_HEADER, session.terminal_id())
            .header(header::CONTENT_TYPE, "application/json");
        if compressed {
            req = req.header(header::CONTENT_ENCODING, "zstd");
        }
        let resp = req
            .body(body)
            .send()
            .await
            .map_err(|e| friendly_error(base, &e))?;
        Self::read_json(base, resp).await
    }

    async fn sync_requested(&self, session: &TerminalSession) -> Result<bool, ApiError> {
        let base = session.server_url();
        let resp = self
            .client
            .get(format!("{base}{SYNC_REQUESTED_PATH}"))
            .header(header::AUTHORIZATION, Self::bearer(session)?)
            .header(TERMINAL_ID_HEADER, session.terminal_id())
            .send()
            .await
            .map_err(|e| friendly_error(base, &e))?;
        let flag: SyncRequestedFlag = Self::read_json(base, resp).await?;
        Ok(flag.sync_requested)
    }

    async fn clear_sync_requested(&self, session: &TerminalSession) -> Result<(), ApiError> {
        let base = session.server_url();
        let resp = self
            .client
            .post(format!("{base}{SYNC_REQUESTED_CLEAR_PATH}"))
            .header(header::AUTHORIZATION, Self::bearer(session)?)
            .header(TERMINAL_ID_HEADER, session.terminal_id())
            .send()
            .await
            .map_err(|e| friendly_error(base, &e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let err = error_from_body(status, &body);
            warn!(error = %err, "failed to clear sync-requested flag");
            return Err(err);
        }
        Ok(())
    }
}
