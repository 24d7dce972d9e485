//! Terminal session context.
//!
//! Everything the sync engine needs to know about "who is talking to which
//! server" lives here and is handed to the engine at construction, so several
//! sessions can coexist in one process (tests run a handful side by side).

use std::fmt;
use std::sync::RwLock;
use tracing::info;
use zeroize::Zeroizing;

use crate::api::normalize_server_url;

pub struct TerminalSession {
    server_url: String,
    terminal_id: String,
    token: RwLock<Option<Zeroizing<String>>>,
}

impl TerminalSession {
    pub fn new(server_url: &str, terminal_id: &str, token: Option<String>) -> Self {
        Self {
            server_url: normalize_server_url(server_url),
            terminal_id: terminal_id.trim().to_string(),
            token: RwLock::new(token.filter(|t| !t.trim().is_empty()).map(Zeroizing::new)),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    /// Copy of the bearer credential, if the terminal is signed in.
    pub fn token(&self) -> Option<Zeroizing<String>> {
        match self.token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn has_credential(&self) -> bool {
        self.token().is_some()
    }

    pub fn set_token(&self, token: String) {
        let mut guard = match self.token.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(Zeroizing::new(token));
    }

    /// Drop the credential. The old value is wiped from memory.
    pub fn logout(&self) {
        let mut guard = match self.token.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = None;
        info!(terminal_id = %self.terminal_id, "terminal session signed out");
    }
}

impl fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalSession")
            .field("server_url", &self.server_url)
            .field("terminal_id", &self.terminal_id)
            .field("has_credential", &self.has_credential())
            .finish()
    }
}
