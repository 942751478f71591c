//! Inbox triage: per-mailbox IMAP polling plus multi-label message classification.

pub mod analysis;
pub mod api;
pub mod classify;
pub mod config;
pub mod error;
pub mod ingest;
pub mod mail;
pub mod secrets;
pub mod store;
pub mod telemetry;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};

/// Key under which a poller and its buffer are tracked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MailboxId(String);

impl MailboxId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Identity derived from the account/server pair.
    pub fn from_parts(account: &str, server: &str) -> Self {
        Self(format!("{}/{}", account.trim(), server.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MailboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MailboxId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Connection credentials for one mailbox. Never persisted.
#[derive(Clone)]
pub struct MailboxCredential {
    pub server: String,
    pub port: u16,
    pub account: String,
    pub password: String,
}

impl MailboxCredential {
    pub fn new(server: Option<&str>, port: u16, account: &str, password: &str) -> Self {
        let server = server
            .map(str::trim)
            .filter(|server| !server.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| default_imap_host(account));

        Self {
            server,
            port,
            account: account.trim().to_string(),
            password: password.to_string(),
        }
    }
}

impl std::fmt::Debug for MailboxCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxCredential")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("account", &"[REDACTED]")
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// `imap.<domain>` for an account address, or the account itself when it has no domain.
fn default_imap_host(account: &str) -> String {
    match account.trim().rsplit_once('@') {
        Some((_, domain)) if !domain.is_empty() => format!("imap.{domain}"),
        _ => account.trim().to_string(),
    }
}

/// A parsed message. Equality covers every field; there is no cheaper identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRecord {
    pub subject: Option<String>,
    pub sender: String,
    pub recipient: Option<String>,
    pub date: Option<String>,
    pub body: String,
}
