//! Terminal credential storage using the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. The server URL, terminal id and API
//! token survive restarts here instead of in a plain config file.

use keyring::Entry;
use thiserror::Error;
use tracing::{info, warn};

use crate::api::{
    extract_api_key_from_connection_string, extract_server_url_from_connection_string,
    extract_terminal_id_from_connection_string, normalize_server_url,
};
use crate::session::TerminalSession;

const SERVICE_NAME: &str = "pos-offline-sync";

// Credential keys
const KEY_SERVER_URL: &str = "server_url";
const KEY_TERMINAL_ID: &str = "terminal_id";
const KEY_API_KEY: &str = "pos_api_key";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_SERVER_URL, KEY_TERMINAL_ID, KEY_API_KEY];

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("missing required field: {0}")]
    Missing(&'static str),
    #[error("credential store: {0}")]
    Keyring(#[from] keyring::Error),
}

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), CredentialError> {
    Entry::new(SERVICE_NAME, key)?.set_password(value)?;
    Ok(())
}

/// Delete a credential. Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), CredentialError> {
    match Entry::new(SERVICE_NAME, key)?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Onboarding input. `api_key` may be a raw token or a connection string
/// carrying `url`, `key` and `tid`.
#[derive(Debug, Clone, Default)]
pub struct TerminalCredentials {
    pub server_url: Option<String>,
    pub terminal_id: Option<String>,
    pub api_key: String,
}

/// Values actually stored after resolving a connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCredentials {
    pub server_url: String,
    pub terminal_id: String,
    pub api_key: String,
}

/// Merge explicit fields with whatever a connection string carries. Values
/// decoded from the connection string win.
pub fn resolve_credentials(input: &TerminalCredentials) -> Result<ResolvedCredentials, CredentialError> {
    let raw_key = input.api_key.trim();
    let mut api_key = raw_key.to_string();
    let mut terminal_id = input
        .terminal_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let mut server_url = input
        .server_url
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(normalize_server_url);

    if let Some(decoded_key) = extract_api_key_from_connection_string(raw_key) {
        api_key = decoded_key;
        if let Some(tid) = extract_terminal_id_from_connection_string(raw_key) {
            if terminal_id.as_deref().is_some_and(|t| t != tid) {
                warn!(decoded_terminal_id = %tid, "terminal id mismatch, preferring connection string");
            }
            terminal_id = Some(tid);
        }
        if let Some(url) = extract_server_url_from_connection_string(raw_key) {
            server_url = Some(url);
        }
    }

    if api_key.is_empty() {
        return Err(CredentialError::Missing("apiKey"));
    }
    Ok(ResolvedCredentials {
        server_url: server_url.ok_or(CredentialError::Missing("serverUrl"))?,
        terminal_id: terminal_id.ok_or(CredentialError::Missing("terminalId"))?,
        api_key,
    })
}

/// Store terminal credentials received during onboarding.
pub fn save_terminal_credentials(input: &TerminalCredentials) -> Result<ResolvedCredentials, CredentialError> {
    let resolved = resolve_credentials(input)?;
    set_credential(KEY_SERVER_URL, &resolved.server_url)?;
    set_credential(KEY_TERMINAL_ID, &resolved.terminal_id)?;
    set_credential(KEY_API_KEY, &resolved.api_key)?;
    info!(terminal_id = %resolved.terminal_id, "terminal credentials updated");
    Ok(resolved)
}

/// The terminal is considered configured when server URL and terminal id are
/// present. The API key may be absent after a logout.
pub fn is_configured() -> bool {
    get_credential(KEY_SERVER_URL).is_some() && get_credential(KEY_TERMINAL_ID).is_some()
}

/// Build a session from the credential store.
pub fn load_session() -> Option<TerminalSession> {
    let server_url = get_credential(KEY_SERVER_URL)?;
    let terminal_id = get_credential(KEY_TERMINAL_ID)?;
    Some(TerminalSession::new(
        &server_url,
        &terminal_id,
        get_credential(KEY_API_KEY),
    ))
}

/// Forget the API token but keep the terminal identity.
pub fn clear_api_key() -> Result<(), CredentialError> {
    delete_credential(KEY_API_KEY)
}

/// Delete every stored credential (factory reset).
pub fn factory_reset() -> Result<(), CredentialError> {
    info!("performing factory reset - deleting all credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;

    #[test]
    fn test_resolve_plain_fields() {
        let resolved = resolve_credentials(&TerminalCredentials {
            server_url: Some("pos.example.com/api/".into()),
            terminal_id: Some(" term-1 ".into()),
            api_key: "tok".into(),
        })
        .unwrap();
        assert_eq!(resolved.server_url, "https://pos.example.com");
        assert_eq!(resolved.terminal_id, "term-1");
        assert_eq!(resolved.api_key, "tok");
    }

    #[test]
    fn test_connection_string_overrides_fields() {
        let payload = r#"{"url":"http://localhost:9000","key":"secret-token","tid":"term-7"}"#;
        let encoded = URL_SAFE_NO_PAD.encode(payload);
        let resolved = resolve_credentials(&TerminalCredentials {
            server_url: None,
            terminal_id: Some("term-1".into()),
            api_key: encoded,
        })
        .unwrap();
        assert_eq!(resolved.server_url, "http://localhost:9000");
        assert_eq!(resolved.terminal_id, "term-7");
        assert_eq!(resolved.api_key, "secret-token");
    }

    #[test]
    fn test_missing_fields_are_reported() {
        let err = resolve_credentials(&TerminalCredentials {
            server_url: Some("http://localhost".into()),
            terminal_id: None,
            api_key: "tok".into(),
        })
        .unwrap_err();
        assert!(matches!(err, CredentialError::Missing("terminalId")));

        let err = resolve_credentials(&TerminalCredentials::default()).unwrap_err();
        assert!(matches!(err, CredentialError::Missing("apiKey")));
    }
}
