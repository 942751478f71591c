//! Configuration loaded from TOML with environment overrides.

use crate::error::{Error, Result};
use crate::mail::transport::{SearchMode, TransportOptions};

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lower bound for any poll interval.
pub const MIN_POLL_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Labelled JSON corpus used to train the classifier at startup.
    pub training_data: PathBuf,
    pub poller: PollerConfig,
    pub api: ApiConfig,
    pub store: StoreConfig,
    pub secrets: SecretsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub default_interval_secs: u64,
    pub stop_timeout_secs: u64,
    pub io_timeout_secs: u64,
    pub search: SearchMode,
    pub fetch_limit: Option<usize>,
    pub folder: String,
    pub imap_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub database_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Base64 AES-256 key for secret refs.
    pub key: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for a daily-rolling log file, in addition to stderr.
    pub directory: Option<PathBuf>,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            training_data: PathBuf::from("training_data.json"),
            poller: PollerConfig::default(),
            api: ApiConfig::default(),
            store: StoreConfig::default(),
            secrets: SecretsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: 60,
            stop_timeout_secs: 30,
            io_timeout_secs: 30,
            search: SearchMode::Unseen,
            fetch_limit: None,
            folder: "INBOX".to_string(),
            imap_port: 993,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://inbox-triage.db?mode=rwc".to_string(),
        }
    }
}

impl Config {
    /// Load from a TOML file (defaults when `None`), then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|error| {
                    Error::Config(format!("failed to read {}: {error}", path.display()))
                })?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|error| Error::Config(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = lookup("INBOX_TRIAGE_TRAINING_DATA") {
            self.training_data = PathBuf::from(path);
        }
        if let Some(key) = lookup("INBOX_TRIAGE_SECRET_KEY") {
            self.secrets.key = Some(key);
        }
        if let Some(url) = lookup("INBOX_TRIAGE_DATABASE_URL") {
            self.store.database_url = url;
        }
        if let Some(bind) = lookup("INBOX_TRIAGE_BIND") {
            self.api.bind = bind.parse().map_err(|error| {
                Error::Config(format!("INBOX_TRIAGE_BIND '{bind}' is not a socket address: {error}"))
            })?;
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.poller.stop_timeout_secs == 0 {
            return Err(Error::Config("poller.stop_timeout_secs must be positive".to_string()));
        }
        if self.poller.io_timeout_secs == 0 {
            return Err(Error::Config("poller.io_timeout_secs must be positive".to_string()));
        }
        if self.poller.fetch_limit == Some(0) {
            return Err(Error::Config("poller.fetch_limit must be positive when set".to_string()));
        }
        if self.poller.folder.trim().is_empty() {
            return Err(Error::Config("poller.folder must not be empty".to_string()));
        }
        Ok(())
    }
}

impl PollerConfig {
    /// Requested interval, or the default, never below the minimum.
    pub fn interval(&self, requested_secs: Option<u64>) -> Duration {
        let secs = requested_secs.unwrap_or(self.default_interval_secs);
        Duration::from_secs(secs.max(MIN_POLL_INTERVAL_SECS))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            folder: self.folder.clone(),
            search: self.search,
            fetch_limit: self.fetch_limit,
            io_timeout: Duration::from_secs(self.io_timeout_secs),
        }
    }
}
