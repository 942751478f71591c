//! Mail transport: IMAP session management behind an async trait.
//!
//! The `imap` client is blocking, so every protocol step runs on the blocking
//! pool and is bounded by the configured I/O timeout. A session owns one
//! authenticated connection with the folder already selected.

use crate::MailboxCredential;
use crate::error::MailError;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::{TcpStream, ToSocketAddrs as _};
use std::time::Duration;

type ImapSession = imap::Session<native_tls::TlsStream<TcpStream>>;

/// IMAP UID of a message within the session that listed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawMessageRef(pub u32);

/// Which messages a listing returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Unseen,
    All,
}

impl SearchMode {
    fn criterion(self) -> &'static str {
        match self {
            Self::Unseen => "UNSEEN",
            Self::All => "ALL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub folder: String,
    pub search: SearchMode,
    /// Only the newest `fetch_limit` refs of a listing are returned.
    pub fetch_limit: Option<usize>,
    pub io_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            folder: "INBOX".to_string(),
            search: SearchMode::Unseen,
            fetch_limit: None,
            io_timeout: Duration::from_secs(30),
        }
    }
}

/// Opens authenticated sessions against a mailbox server.
#[async_trait]
pub trait MailTransport: Send + Sync + 'static {
    async fn connect(
        &self,
        credential: &MailboxCredential,
    ) -> Result<Box<dyn MailSession>, MailError>;
}

/// One live connection. Refs it returns are only valid on this session.
#[async_trait]
pub trait MailSession: Send {
    /// List message refs in ascending arrival order.
    async fn list_new(&mut self) -> Result<Vec<RawMessageRef>, MailError>;

    async fn fetch_raw(&mut self, message: RawMessageRef) -> Result<Vec<u8>, MailError>;

    /// Best-effort teardown; transport errors are swallowed.
    async fn close(self: Box<Self>);
}

/// IMAP over implicit TLS.
#[derive(Debug, Clone, Default)]
pub struct ImapTransport {
    options: TransportOptions,
}

impl ImapTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl MailTransport for ImapTransport {
    async fn connect(
        &self,
        credential: &MailboxCredential,
    ) -> Result<Box<dyn MailSession>, MailError> {
        let credential = credential.clone();
        let options = self.options.clone();
        let timeout = options.io_timeout;

        let session = run_blocking("IMAP connect", timeout, move || {
            open_imap_session(&credential, &options)
        })
        .await?;

        Ok(Box::new(ImapMailSession {
            session: Some(session),
            options: self.options.clone(),
        }))
    }
}

struct ImapMailSession {
    /// `None` once a timed-out step abandoned the connection on the blocking pool.
    session: Option<ImapSession>,
    options: TransportOptions,
}

impl ImapMailSession {
    fn take_session(&mut self) -> Result<ImapSession, MailError> {
        self.session
            .take()
            .ok_or_else(|| MailError::Network("IMAP session is no longer usable".to_string()))
    }
}

#[async_trait]
impl MailSession for ImapMailSession {
    async fn list_new(&mut self) -> Result<Vec<RawMessageRef>, MailError> {
        let mut session = self.take_session()?;
        let criterion = self.options.search.criterion();
        let limit = self.options.fetch_limit;
        let timeout = self.options.io_timeout;

        let (session, result) = run_blocking("IMAP search", timeout, move || {
            let result = session
                .uid_search(criterion)
                .map(|uids| select_refs(uids, limit))
                .map_err(|error| map_imap_error(error, timeout));
            Ok((session, result))
        })
        .await?;

        self.session = Some(session);
        result
    }

    async fn fetch_raw(&mut self, message: RawMessageRef) -> Result<Vec<u8>, MailError> {
        let mut session = self.take_session()?;
        let uid = message.0;
        let timeout = self.options.io_timeout;

        let (session, result) = run_blocking("IMAP fetch", timeout, move || {
            let result = match session.uid_fetch(uid.to_string(), "RFC822") {
                Ok(fetches) => fetches
                    .iter()
                    .find_map(|fetch| fetch.body())
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| MailError::Fetch {
                        uid,
                        reason: "message body missing from fetch response".to_string(),
                    }),
                Err(imap::error::Error::No(reason) | imap::error::Error::Bad(reason)) => {
                    Err(MailError::Fetch { uid, reason })
                }
                Err(error) => Err(map_imap_error(error, timeout)),
            };
            Ok((session, result))
        })
        .await?;

        self.session = Some(session);
        result
    }

    async fn close(mut self: Box<Self>) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        let task = tokio::task::spawn_blocking(move || {
            if let Err(error) = session.logout() {
                tracing::debug!(%error, "IMAP logout failed");
            }
        });

        if tokio::time::timeout(self.options.io_timeout, task).await.is_err() {
            tracing::debug!("IMAP logout timed out");
        }
    }
}

async fn run_blocking<T, F>(
    operation: &'static str,
    timeout: Duration,
    work: F,
) -> Result<T, MailError>
where
    F: FnOnce() -> Result<T, MailError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(work)).await {
        Ok(Ok(result)) => result,
        Ok(Err(error)) => Err(MailError::Network(format!("{operation} task failed: {error}"))),
        Err(_) => Err(MailError::Timeout { operation, timeout }),
    }
}

fn open_imap_session(
    credential: &MailboxCredential,
    options: &TransportOptions,
) -> Result<ImapSession, MailError> {
    let address = (credential.server.as_str(), credential.port)
        .to_socket_addrs()
        .map_err(|error| {
            MailError::Network(format!(
                "failed to resolve IMAP server '{}:{}': {error}",
                credential.server, credential.port
            ))
        })?
        .next()
        .ok_or_else(|| {
            MailError::Network(format!(
                "IMAP server '{}' resolved to no addresses",
                credential.server
            ))
        })?;

    let tcp = TcpStream::connect_timeout(&address, options.io_timeout).map_err(|error| {
        map_io_error(
            error,
            format!(
                "failed to connect to IMAP server '{}:{}'",
                credential.server, credential.port
            ),
            options.io_timeout,
        )
    })?;
    tcp.set_read_timeout(Some(options.io_timeout))
        .and_then(|_| tcp.set_write_timeout(Some(options.io_timeout)))
        .map_err(|error| MailError::Network(format!("failed to configure socket: {error}")))?;

    let tls = native_tls::TlsConnector::builder()
        .build()
        .map_err(|error| MailError::Network(format!("failed to build TLS connector: {error}")))?;
    let stream = tls
        .connect(credential.server.as_str(), tcp)
        .map_err(|error| MailError::Network(format!("TLS handshake failed: {error}")))?;

    let mut client = imap::Client::new(stream);
    client
        .read_greeting()
        .map_err(|error| map_imap_error(error, options.io_timeout))?;

    let mut session = client
        .login(credential.account.as_str(), credential.password.as_str())
        .map_err(|(error, _client)| match error {
            imap::error::Error::No(reason) | imap::error::Error::Bad(reason) => MailError::Auth {
                account: credential.account.clone(),
                reason,
            },
            other => map_imap_error(other, options.io_timeout),
        })?;

    if let Err(error) = session.select(options.folder.as_str()) {
        session.logout().ok();
        return Err(MailError::Network(format!(
            "failed to select IMAP folder '{}': {error}",
            options.folder
        )));
    }

    Ok(session)
}

fn map_imap_error(error: imap::error::Error, timeout: Duration) -> MailError {
    match error {
        imap::error::Error::Io(error) => map_io_error(error, "IMAP I/O error".to_string(), timeout),
        other => MailError::Network(other.to_string()),
    }
}

fn map_io_error(error: std::io::Error, context: String, timeout: Duration) -> MailError {
    match error.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => MailError::Timeout {
            operation: "IMAP socket",
            timeout,
        },
        _ => MailError::Network(format!("{context}: {error}")),
    }
}

/// Ascending UIDs, trimmed to the newest `limit` when set.
fn select_refs(
    uids: impl IntoIterator<Item = u32>,
    limit: Option<usize>,
) -> Vec<RawMessageRef> {
    let mut uids: Vec<u32> = uids.into_iter().collect();
    uids.sort_unstable();

    if let Some(limit) = limit
        && uids.len() > limit
    {
        uids.drain(..uids.len() - limit);
    }

    uids.into_iter().map(RawMessageRef).collect()
}
