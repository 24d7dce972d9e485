//! Bearer-token auth middleware for terminal endpoints.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request};
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

use super::error::ServerError;
use super::routes::AppState;
use crate::protocol::TERMINAL_ID_HEADER;

/// Identity of the calling terminal, scoped to its organization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub organization_id: String,
    pub terminal_id: String,
}

impl AuthContext {
    /// A request body naming another terminal is refused outright.
    pub fn ensure_terminal(&self, terminal_id: &str) -> Result<(), ServerError> {
        if terminal_id != self.terminal_id {
            return Err(ServerError::Forbidden(format!(
                "terminal {terminal_id} does not match the authenticated terminal"
            )));
        }
        Ok(())
    }
}

fn bearer_token(request: &Request<Body>) -> Result<&str, ServerError> {
    let raw = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServerError::Unauthorized("Missing Authorization header".to_string()))?;
    raw.strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ServerError::Unauthorized("Invalid auth scheme".to_string()))
}

/// Resolve the bearer token, check the `x-terminal-id` header against it and
/// attach the [`AuthContext`] to the request.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ServerError> {
    let token = bearer_token(&request)?.to_string();
    let ctx = state
        .store
        .authenticate(&token)?
        .ok_or_else(|| ServerError::Unauthorized("API key is invalid or expired".to_string()))?;

    let header_terminal = request
        .headers()
        .get(TERMINAL_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServerError::BadRequest(format!("Missing {TERMINAL_ID_HEADER} header")))?;
    ctx.ensure_terminal(header_terminal)?;

    debug!(terminal_id = %ctx.terminal_id, path = %request.uri().path(), "authenticated");
    request.extensions_mut().insert(ctx);
    Ok(next.run(request).await)
}
