//! Per-mailbox polling loops and the registry that owns them.
//!
//! Each mailbox gets its own tokio task that connects, lists new messages,
//! fetches and parses them, and appends unseen records to the mailbox
//! buffer. A failed iteration is logged and retried on the next interval;
//! only an explicit stop ends the loop.

use crate::error::{Error, MailError, Result};
use crate::mail::buffer::MessageBuffer;
use crate::mail::parser::parse_message;
use crate::mail::transport::{MailSession, MailTransport};
use crate::{MailboxCredential, MailboxId, MessageRecord};

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;

/// Lifecycle of a mailbox poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    Idle,
    Running,
    Stopping,
}

/// Outcome of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Started,
    AlreadyRunning,
    /// A stop is in flight; start again once it completes.
    Stopping,
}

/// A running loop together with the signal that ends it.
struct PollerTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Poller {
    interval: Duration,
    state: PollerState,
    buffer: Arc<MessageBuffer>,
    /// Taken by `stop`.
    task: Option<PollerTask>,
}

/// Owns every active mailbox poller.
pub struct PollerRegistry {
    transport: Arc<dyn MailTransport>,
    pollers: RwLock<HashMap<MailboxId, Poller>>,
    stop_timeout: Duration,
}

impl std::fmt::Debug for PollerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerRegistry")
            .field("stop_timeout", &self.stop_timeout)
            .finish_non_exhaustive()
    }
}

impl PollerRegistry {
    pub fn new(transport: Arc<dyn MailTransport>, stop_timeout: Duration) -> Self {
        Self {
            transport,
            pollers: RwLock::new(HashMap::new()),
            stop_timeout,
        }
    }

    /// Start polling a mailbox.
    ///
    /// Idempotent: a mailbox with a live loop keeps that loop and its buffer.
    pub async fn start(
        &self,
        mailbox: MailboxId,
        credential: MailboxCredential,
        interval: Duration,
    ) -> PollStatus {
        let mut pollers = self.pollers.write().await;

        let buffer = match pollers.get(&mailbox) {
            Some(poller) if poller.state == PollerState::Stopping => {
                return PollStatus::Stopping;
            }
            Some(poller) => {
                let alive = poller
                    .task
                    .as_ref()
                    .is_some_and(|task| !task.handle.is_finished());
                if alive {
                    tracing::debug!(mailbox = %mailbox, "poller already running");
                    return PollStatus::AlreadyRunning;
                }
                tracing::warn!(mailbox = %mailbox, "poller loop exited unexpectedly, restarting");
                poller.buffer.clone()
            }
            None => Arc::new(MessageBuffer::new()),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_poll_loop(
            mailbox.clone(),
            credential,
            interval,
            self.transport.clone(),
            buffer.clone(),
            shutdown_rx,
        ));

        pollers.insert(
            mailbox.clone(),
            Poller {
                interval,
                state: PollerState::Running,
                buffer,
                task: Some(PollerTask {
                    shutdown_tx,
                    handle,
                }),
            },
        );

        tracing::info!(mailbox = %mailbox, interval_secs = interval.as_secs_f64(), "poller started");
        PollStatus::Started
    }

    /// Signal a poller to stop and wait for its loop to exit.
    ///
    /// The loop observes the signal between iterations, so the wait is bounded
    /// by one fetch cycle. Exceeding the stop timeout aborts the task and is
    /// reported as an error.
    pub async fn stop(&self, mailbox: &MailboxId) -> Result<()> {
        let task = {
            let mut pollers = self.pollers.write().await;
            let poller = pollers
                .get_mut(mailbox)
                .ok_or_else(|| Error::UnknownMailbox(mailbox.to_string()))?;
            poller.state = PollerState::Stopping;
            poller.task.take()
        };

        let Some(task) = task else {
            tracing::debug!(mailbox = %mailbox, "stop already in progress");
            return Ok(());
        };

        task.shutdown_tx.send(true).ok();
        let abort_handle = task.handle.abort_handle();

        let outcome = match tokio::time::timeout(self.stop_timeout, task.handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => {
                tracing::warn!(mailbox = %mailbox, %error, "poller task join failed during stop");
                Ok(())
            }
            Err(_) => {
                abort_handle.abort();
                tracing::error!(
                    mailbox = %mailbox,
                    timeout = ?self.stop_timeout,
                    "poller did not stop in time, aborted"
                );
                Err(Error::StopTimeout {
                    mailbox: mailbox.to_string(),
                    timeout: self.stop_timeout,
                })
            }
        };

        self.pollers.write().await.remove(mailbox);
        tracing::info!(mailbox = %mailbox, "poller stopped");
        outcome
    }

    /// Current buffer snapshot for a mailbox.
    pub async fn records(&self, mailbox: &MailboxId) -> Result<Arc<Vec<MessageRecord>>> {
        let pollers = self.pollers.read().await;
        pollers
            .get(mailbox)
            .map(|poller| poller.buffer.snapshot())
            .ok_or_else(|| Error::UnknownMailbox(mailbox.to_string()))
    }

    pub async fn state(&self, mailbox: &MailboxId) -> PollerState {
        let pollers = self.pollers.read().await;
        pollers
            .get(mailbox)
            .map(|poller| poller.state)
            .unwrap_or(PollerState::Idle)
    }

    pub async fn interval(&self, mailbox: &MailboxId) -> Option<Duration> {
        let pollers = self.pollers.read().await;
        pollers.get(mailbox).map(|poller| poller.interval)
    }

    pub async fn active(&self) -> Vec<MailboxId> {
        let pollers = self.pollers.read().await;
        let mut mailboxes: Vec<MailboxId> = pollers.keys().cloned().collect();
        mailboxes.sort();
        mailboxes
    }

    /// Stop every poller. Failures are logged; the first one is returned.
    pub async fn shutdown(&self) -> Result<()> {
        let mut first_error = None;

        for mailbox in self.active().await {
            if let Err(error) = self.stop(&mailbox).await {
                tracing::error!(mailbox = %mailbox, %error, "failed to stop poller during shutdown");
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

async fn run_poll_loop(
    mailbox: MailboxId,
    credential: MailboxCredential,
    interval: Duration,
    transport: Arc<dyn MailTransport>,
    buffer: Arc<MessageBuffer>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        match fetch_cycle(transport.as_ref(), &credential).await {
            Ok(records) => {
                let fetched = records.len();
                let added = buffer.append_unique(records);
                tracing::debug!(
                    mailbox = %mailbox,
                    fetched,
                    added,
                    total = buffer.len(),
                    "poll cycle complete"
                );
            }
            Err(error) => {
                tracing::warn!(
                    mailbox = %mailbox,
                    transient = error.is_transient(),
                    %error,
                    "poll cycle failed, retrying next interval"
                );
            }
        }

        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }

    tracing::debug!(mailbox = %mailbox, "poll loop exited");
}

/// One connect/list/fetch/parse pass. The session is closed on every path.
///
/// Messages whose refs fail to fetch are skipped; any other failure aborts the pass.
pub(crate) async fn fetch_cycle(
    transport: &dyn MailTransport,
    credential: &MailboxCredential,
) -> std::result::Result<Vec<MessageRecord>, MailError> {
    let mut session = transport.connect(credential).await?;
    let result = fetch_new_messages(session.as_mut()).await;
    session.close().await;
    result
}

async fn fetch_new_messages(
    session: &mut dyn MailSession,
) -> std::result::Result<Vec<MessageRecord>, MailError> {
    let refs = session.list_new().await?;
    let mut records = Vec::with_capacity(refs.len());

    for message in refs {
        match session.fetch_raw(message).await {
            Ok(raw) => records.push(parse_message(&raw)),
            Err(error @ MailError::Fetch { .. }) => {
                tracing::warn!(uid = message.0, %error, "skipping unfetchable message");
            }
            Err(error) => return Err(error),
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::{PollStatus, PollerRegistry, PollerState, fetch_cycle};
    use crate::error::{Error, MailError};
    use crate::mail::transport::testing::ScriptedTransport;
    use crate::mail::transport::{MailSession, MailTransport};
    use crate::{MailboxCredential, MailboxId};

    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    const TICK: Duration = Duration::from_millis(10);

    fn raw(subject: &str) -> Vec<u8> {
        format!("From: a@example.com\r\nSubject: {subject}\r\n\r\nbody of {subject}\r\n")
            .into_bytes()
    }

    fn credential(password: &str) -> MailboxCredential {
        MailboxCredential::new(Some("imap.example.com"), 993, "a@example.com", password)
    }

    async fn wait_until(mut condition: impl AsyncFnMut() -> bool) {
        for _ in 0..400 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    struct HangingTransport;

    #[async_trait]
    impl MailTransport for HangingTransport {
        async fn connect(
            &self,
            _credential: &MailboxCredential,
        ) -> Result<Box<dyn MailSession>, MailError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn start_is_idempotent_per_mailbox() {
        let transport = ScriptedTransport::with_messages(vec![raw("one"), raw("two")]);
        let registry = PollerRegistry::new(Arc::new(transport.clone()), Duration::from_secs(5));
        let mailbox = MailboxId::new("a@example.com");
        let interval = Duration::from_secs(3600);

        let first = registry
            .start(mailbox.clone(), credential("pw"), interval)
            .await;
        let second = registry
            .start(mailbox.clone(), credential("pw"), interval)
            .await;
        assert_eq!(first, PollStatus::Started);
        assert_eq!(second, PollStatus::AlreadyRunning);

        wait_until(async || registry.records(&mailbox).await.unwrap().len() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(transport.connect_count(), 1);
        assert_eq!(registry.records(&mailbox).await.unwrap().len(), 2);
        assert_eq!(registry.active().await, vec![mailbox.clone()]);

        registry.stop(&mailbox).await.unwrap();
    }

    #[tokio::test]
    async fn repeated_iterations_do_not_duplicate_records() {
        let transport = ScriptedTransport::with_messages(vec![raw("one")]);
        let registry = PollerRegistry::new(Arc::new(transport.clone()), Duration::from_secs(5));
        let mailbox = MailboxId::new("a@example.com");

        registry.start(mailbox.clone(), credential("pw"), TICK).await;
        wait_until(async || transport.connect_count() >= 3).await;
        assert_eq!(registry.records(&mailbox).await.unwrap().len(), 1);

        transport.set_messages(vec![raw("one"), raw("two")]);
        wait_until(async || registry.records(&mailbox).await.unwrap().len() == 2).await;

        let records = registry.records(&mailbox).await.unwrap();
        assert_eq!(records[0].subject.as_deref(), Some("one"));
        assert_eq!(records[1].subject.as_deref(), Some("two"));
        assert!(transport.close_count() >= 3);

        registry.stop(&mailbox).await.unwrap();
    }

    #[tokio::test]
    async fn transient_failures_do_not_end_the_loop() {
        let transport = ScriptedTransport::with_messages(vec![raw("late")]);
        transport.fail_next_connects(3);
        let registry = PollerRegistry::new(Arc::new(transport.clone()), Duration::from_secs(5));
        let mailbox = MailboxId::new("a@example.com");

        registry.start(mailbox.clone(), credential("pw"), TICK).await;
        wait_until(async || registry.records(&mailbox).await.unwrap().len() == 1).await;

        assert!(transport.connect_count() >= 4);
        assert_eq!(registry.state(&mailbox).await, PollerState::Running);
        registry.stop(&mailbox).await.unwrap();
    }

    #[tokio::test]
    async fn auth_failures_keep_polling() {
        let transport = ScriptedTransport::with_messages(vec![raw("one")]);
        transport.reject_password("wrong");
        let registry = PollerRegistry::new(Arc::new(transport.clone()), Duration::from_secs(5));
        let mailbox = MailboxId::new("a@example.com");

        registry.start(mailbox.clone(), credential("wrong"), TICK).await;
        wait_until(async || transport.connect_count() >= 3).await;

        assert_eq!(registry.state(&mailbox).await, PollerState::Running);
        assert!(registry.records(&mailbox).await.unwrap().is_empty());
        registry.stop(&mailbox).await.unwrap();
    }

    #[tokio::test]
    async fn stop_right_after_start_leaves_no_task() {
        let transport = ScriptedTransport::with_messages(vec![raw("one")]);
        let registry = PollerRegistry::new(Arc::new(transport), Duration::from_secs(5));
        let mailbox = MailboxId::new("a@example.com");

        registry
            .start(mailbox.clone(), credential("pw"), Duration::from_secs(3600))
            .await;

        tokio::time::timeout(Duration::from_secs(5), registry.stop(&mailbox))
            .await
            .expect("stop exceeded timeout")
            .unwrap();

        assert_eq!(registry.state(&mailbox).await, PollerState::Idle);
        assert!(registry.active().await.is_empty());
        assert!(matches!(
            registry.records(&mailbox).await,
            Err(Error::UnknownMailbox(_))
        ));
    }

    #[tokio::test]
    async fn stop_timeout_is_reported() {
        let registry = PollerRegistry::new(Arc::new(HangingTransport), Duration::from_millis(50));
        let mailbox = MailboxId::new("a@example.com");

        registry.start(mailbox.clone(), credential("pw"), TICK).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = registry.stop(&mailbox).await;
        assert!(matches!(result, Err(Error::StopTimeout { .. })));
        assert_eq!(registry.state(&mailbox).await, PollerState::Idle);
    }

    #[tokio::test]
    async fn unknown_mailbox_is_reported() {
        let registry =
            PollerRegistry::new(Arc::new(ScriptedTransport::default()), Duration::from_secs(1));
        let mailbox = MailboxId::new("nobody@example.com");

        assert!(matches!(
            registry.records(&mailbox).await,
            Err(Error::UnknownMailbox(_))
        ));
        assert!(matches!(
            registry.stop(&mailbox).await,
            Err(Error::UnknownMailbox(_))
        ));
        assert_eq!(registry.interval(&mailbox).await, None);
    }

    #[tokio::test]
    async fn shutdown_stops_every_poller() {
        let transport = ScriptedTransport::with_messages(vec![raw("one")]);
        let registry = PollerRegistry::new(Arc::new(transport), Duration::from_secs(5));

        for account in ["a@example.com", "b@example.com"] {
            registry
                .start(MailboxId::new(account), credential("pw"), TICK)
                .await;
        }
        assert_eq!(registry.active().await.len(), 2);

        registry.shutdown().await.unwrap();
        assert!(registry.active().await.is_empty());
    }

    #[tokio::test]
    async fn fetch_cycle_skips_missing_refs_and_closes_session() {
        let transport = ScriptedTransport::with_messages(vec![raw("gone"), raw("kept")]);
        transport.mark_missing(1);

        let records = fetch_cycle(&transport, &credential("pw")).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].subject.as_deref(), Some("kept"));
        assert_eq!(transport.close_count(), 1);
    }
}
