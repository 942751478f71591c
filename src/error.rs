//! Error taxonomy for mailbox ingestion and classification.

use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Mail(#[from] MailError),

    #[error(transparent)]
    Classify(#[from] ClassifyError),

    /// Queried a mailbox that has no poller.
    #[error("poller not started for mailbox '{0}'")]
    UnknownMailbox(String),

    /// A poller loop did not exit within the configured stop timeout.
    #[error("poller for mailbox '{mailbox}' did not stop within {timeout:?}")]
    StopTimeout { mailbox: String, timeout: Duration },

    #[error("config error: {0}")]
    Config(String),

    #[error("secret error: {0}")]
    Secret(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures raised by the mail transport.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("authentication failed for '{account}': {reason}")]
    Auth { account: String, reason: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The message reference is missing or no longer valid in this session.
    #[error("failed to fetch message uid {uid}: {reason}")]
    Fetch { uid: u32, reason: String },
}

/// Failures raised by the classification model.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("training failed: {0}")]
    Training(String),

    #[error("model not trained yet")]
    Untrained,
}

impl MailError {
    /// Whether the next poll iteration may succeed without caller action.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout { .. })
    }
}
