//! Query and aggregation over buffered and stored mail.
//!
//! `MailService` is the surface the HTTP layer and CLI call into. It owns the
//! poller registry, holds the trained model, and classifies records lazily on
//! every query: buffers only ever hold parsed records, never analysis results.

use crate::classify::{AnalysisResult, ClassificationModel, Dimension};
use crate::config::PollerConfig;
use crate::error::{Error, Result};
use crate::ingest::ingest_unseen;
use crate::mail::poller::{PollStatus, PollerRegistry, PollerState};
use crate::mail::transport::MailTransport;
use crate::secrets::SecretResolver;
use crate::store::{MessageStore, StoredMessage};
use crate::{MailboxCredential, MailboxId, MessageRecord};

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A message paired with its classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzedMessage<M = MessageRecord> {
    pub message: M,
    pub analysis: AnalysisResult,
}

/// Label counts per dimension for one mailbox buffer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MailboxStats {
    pub total: usize,
    #[serde(flatten)]
    pub dimensions: BTreeMap<&'static str, BTreeMap<String, usize>>,
}

impl MailboxStats {
    fn from_analyses<'a, M: 'a>(analyzed: impl IntoIterator<Item = &'a AnalyzedMessage<M>>) -> Self {
        let mut stats = Self {
            total: 0,
            dimensions: Dimension::ALL
                .iter()
                .map(|dimension| (dimension.as_str(), BTreeMap::new()))
                .collect(),
        };

        for item in analyzed {
            stats.total += 1;
            for dimension in Dimension::ALL {
                let label = item.analysis.label(dimension).to_string();
                if let Some(counts) = stats.dimensions.get_mut(dimension.as_str()) {
                    *counts.entry(label).or_default() += 1;
                }
            }
        }

        stats
    }

    pub fn count(&self, dimension: Dimension, label: &str) -> usize {
        self.dimensions
            .get(dimension.as_str())
            .and_then(|counts| counts.get(label))
            .copied()
            .unwrap_or(0)
    }
}

/// Result of a start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartedPoll {
    pub mailbox: MailboxId,
    pub status: PollStatus,
    pub interval_secs: u64,
}

/// Parameters for starting a poller. `server` defaults to `imap.<domain>`,
/// `mailbox` to `account/server`.
#[derive(Debug, Clone, Default)]
pub struct PollRequest<'a> {
    pub mailbox: Option<MailboxId>,
    pub server: Option<&'a str>,
    pub account: &'a str,
    pub interval_secs: Option<u64>,
}

pub struct MailService {
    model: Arc<ClassificationModel>,
    registry: PollerRegistry,
    transport: Arc<dyn MailTransport>,
    poller_config: PollerConfig,
    store: Option<Arc<dyn MessageStore>>,
    secrets: Option<Arc<dyn SecretResolver>>,
}

impl std::fmt::Debug for MailService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailService")
            .field("trained", &self.model.is_trained())
            .field("registry", &self.registry)
            .field("store", &self.store.is_some())
            .field("secrets", &self.secrets.is_some())
            .finish()
    }
}

impl MailService {
    pub fn new(
        model: Arc<ClassificationModel>,
        transport: Arc<dyn MailTransport>,
        poller_config: PollerConfig,
    ) -> Self {
        Self {
            registry: PollerRegistry::new(transport.clone(), poller_config.stop_timeout()),
            model,
            transport,
            poller_config,
            store: None,
            secrets: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretResolver>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn model(&self) -> &ClassificationModel {
        &self.model
    }

    pub fn credential(&self, server: Option<&str>, account: &str, password: &str) -> MailboxCredential {
        MailboxCredential::new(server, self.poller_config.imap_port, account, password)
    }

    /// Credential whose password is resolved from an encrypted secret ref.
    pub fn credential_with_secret(
        &self,
        server: Option<&str>,
        account: &str,
        secret_ref: &str,
    ) -> Result<MailboxCredential> {
        let password = self.secrets()?.resolve_password(secret_ref)?;
        Ok(self.credential(server, account, &password))
    }

    pub async fn start_poll(&self, request: PollRequest<'_>, password: &str) -> StartedPoll {
        let credential = self.credential(request.server, request.account, password);
        let mailbox = request
            .mailbox
            .unwrap_or_else(|| MailboxId::from_parts(&credential.account, &credential.server));
        let interval = self.poller_config.interval(request.interval_secs);

        let status = self
            .registry
            .start(mailbox.clone(), credential, interval)
            .await;

        StartedPoll {
            mailbox,
            status,
            interval_secs: interval.as_secs(),
        }
    }

    /// Start a poller whose password comes from an encrypted secret ref.
    pub async fn start_poll_with_secret(
        &self,
        request: PollRequest<'_>,
        secret_ref: &str,
    ) -> Result<StartedPoll> {
        let password = self.secrets()?.resolve_password(secret_ref)?;
        Ok(self.start_poll(request, &password).await)
    }

    pub async fn stop_poll(&self, mailbox: &MailboxId) -> Result<()> {
        self.registry.stop(mailbox).await
    }

    pub async fn poller_status(&self, mailbox: &MailboxId) -> PollerState {
        self.registry.state(mailbox).await
    }

    /// Interval of a registered poller, in whole seconds.
    pub async fn poll_interval_secs(&self, mailbox: &MailboxId) -> Option<u64> {
        self.registry
            .interval(mailbox)
            .await
            .map(|interval| interval.as_secs())
    }

    pub async fn active_pollers(&self) -> Vec<MailboxId> {
        self.registry.active().await
    }

    pub async fn list_buffered(&self, mailbox: &MailboxId) -> Result<Arc<Vec<MessageRecord>>> {
        self.registry.records(mailbox).await
    }

    pub async fn analyze_buffered(&self, mailbox: &MailboxId) -> Result<Vec<AnalyzedMessage>> {
        let records = self.registry.records(mailbox).await?;
        records
            .iter()
            .map(|record| self.analyze_record(record.clone()))
            .collect()
    }

    pub fn analyze_text(&self, text: &str) -> Result<AnalysisResult> {
        Ok(self.model.predict_detailed(text)?)
    }

    pub async fn stats(&self, mailbox: &MailboxId) -> Result<MailboxStats> {
        let analyzed = self.analyze_buffered(mailbox).await?;
        Ok(MailboxStats::from_analyses(&analyzed))
    }

    pub async fn filter_by_priority(
        &self,
        mailbox: &MailboxId,
        priority: &str,
    ) -> Result<Vec<AnalyzedMessage>> {
        self.filter_by(mailbox, Dimension::Priority, priority).await
    }

    pub async fn filter_by_department(
        &self,
        mailbox: &MailboxId,
        department: &str,
    ) -> Result<Vec<AnalyzedMessage>> {
        self.filter_by(mailbox, Dimension::Department, department)
            .await
    }

    /// Exact, case-sensitive label match. Buffer order is preserved.
    async fn filter_by(
        &self,
        mailbox: &MailboxId,
        dimension: Dimension,
        label: &str,
    ) -> Result<Vec<AnalyzedMessage>> {
        let mut analyzed = self.analyze_buffered(mailbox).await?;
        analyzed.retain(|item| item.analysis.label(dimension) == label);
        Ok(analyzed)
    }

    /// One fetch cycle persisted straight to the store.
    pub async fn ingest(
        &self,
        owner: &str,
        credential: &MailboxCredential,
    ) -> Result<Vec<StoredMessage>> {
        let store = self.store()?;
        ingest_unseen(self.transport.as_ref(), credential, store.as_ref(), owner).await
    }

    pub async fn list_stored(&self, owner: &str) -> Result<Vec<StoredMessage>> {
        self.store()?.list_stored(owner).await
    }

    pub async fn mark_read(&self, owner: &str, id: i64) -> Result<bool> {
        self.store()?.mark_read(owner, id).await
    }

    pub async fn analyze_stored(&self, owner: &str) -> Result<Vec<AnalyzedMessage<StoredMessage>>> {
        let stored = self.list_stored(owner).await?;
        stored
            .into_iter()
            .map(|message| -> Result<AnalyzedMessage<StoredMessage>> {
                let analysis = self.model.predict_detailed(classification_text(&message.record))?;
                Ok(AnalyzedMessage { message, analysis })
            })
            .collect()
    }

    /// Stop every poller.
    pub async fn shutdown(&self) -> Result<()> {
        self.registry.shutdown().await
    }

    fn analyze_record(&self, record: MessageRecord) -> Result<AnalyzedMessage> {
        let analysis = self.model.predict_detailed(classification_text(&record))?;
        Ok(AnalyzedMessage {
            message: record,
            analysis,
        })
    }

    fn store(&self) -> Result<&Arc<dyn MessageStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| Error::Config("no message store configured".to_string()))
    }

    fn secrets(&self) -> Result<&Arc<dyn SecretResolver>> {
        self.secrets
            .as_ref()
            .ok_or_else(|| Error::Secret("no secret key configured".to_string()))
    }
}

/// The model is trained on bodies; fall back to the subject when a body is blank.
fn classification_text(record: &MessageRecord) -> &str {
    if record.body.trim().is_empty() {
        record.subject.as_deref().unwrap_or_default()
    } else {
        &record.body
    }
}

#[cfg(test)]
mod tests {
    use super::{MailService, PollRequest};
    use crate::classify::{ClassificationModel, Dimension, TrainingCorpus, TrainingRecord};
    use crate::config::PollerConfig;
    use crate::error::{ClassifyError, Error};
    use crate::mail::poller::{PollStatus, PollerState};
    use crate::mail::transport::testing::ScriptedTransport;
    use crate::secrets::AesGcmSecrets;
    use crate::store::SqliteMessageStore;
    use crate::MailboxId;

    use std::sync::Arc;
    use std::time::Duration;

    fn training_record(body: &str, category: &str, priority: &str, department: &str) -> TrainingRecord {
        TrainingRecord {
            body: body.to_string(),
            category: category.to_string(),
            subcategory: format!("{category}_general"),
            priority: priority.to_string(),
            sentiment: "negative".to_string(),
            urgency: priority.to_string(),
            department: department.to_string(),
            action_required: format!("route_{department}"),
            response_template: format!("{category}_reply"),
        }
    }

    fn model() -> Arc<ClassificationModel> {
        let corpus = TrainingCorpus::new(vec![
            training_record(
                "invoice charged twice billing refund payment",
                "billing",
                "high",
                "finance",
            ),
            training_record(
                "invoice payment billing statement question",
                "billing",
                "high",
                "finance",
            ),
            training_record(
                "package courier delivery late damaged box",
                "shipping",
                "low",
                "logistics",
            ),
        ]);
        Arc::new(ClassificationModel::from_corpus(&corpus).unwrap())
    }

    fn message(subject: &str, body: &str) -> Vec<u8> {
        format!("From: customer@example.com\r\nSubject: {subject}\r\n\r\n{body}\r\n").into_bytes()
    }

    fn config() -> PollerConfig {
        PollerConfig {
            stop_timeout_secs: 5,
            ..PollerConfig::default()
        }
    }

    fn service(transport: &ScriptedTransport) -> MailService {
        MailService::new(model(), Arc::new(transport.clone()), config())
    }

    fn request(account: &str) -> PollRequest<'_> {
        PollRequest {
            account,
            ..PollRequest::default()
        }
    }

    async fn wait_for_records(service: &MailService, mailbox: &MailboxId, count: usize) {
        for _ in 0..200 {
            if service
                .list_buffered(mailbox)
                .await
                .is_ok_and(|records| records.len() >= count)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("buffer for {mailbox} never reached {count} records");
    }

    #[tokio::test]
    async fn start_derives_identity_and_clamps_interval() {
        let transport = ScriptedTransport::default();
        let service = service(&transport);

        let started = service
            .start_poll(
                PollRequest {
                    interval_secs: Some(1),
                    ..request("alice@example.com")
                },
                "pw",
            )
            .await;
        assert_eq!(started.mailbox.as_str(), "alice@example.com/imap.example.com");
        assert_eq!(started.status, PollStatus::Started);
        assert_eq!(started.interval_secs, 5);
        assert_eq!(service.poll_interval_secs(&started.mailbox).await, Some(5));

        let again = service.start_poll(request("alice@example.com"), "pw").await;
        assert_eq!(again.status, PollStatus::AlreadyRunning);
        assert_eq!(
            service.poller_status(&started.mailbox).await,
            PollerState::Running
        );

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn buffered_messages_are_classified_and_aggregated() {
        let transport = ScriptedTransport::with_messages(vec![
            message("Refund", "I was charged twice on my invoice, refund the payment"),
            message("Late", "The courier delivery is late and the box is damaged"),
            message("Billing", "Question about my billing statement and invoice"),
        ]);
        let service = service(&transport);
        let mailbox = service
            .start_poll(request("alice@example.com"), "pw")
            .await
            .mailbox;
        wait_for_records(&service, &mailbox, 3).await;

        let analyzed = service.analyze_buffered(&mailbox).await.unwrap();
        let categories: Vec<_> = analyzed
            .iter()
            .map(|item| item.analysis.category.as_str())
            .collect();
        assert_eq!(categories, vec!["billing", "shipping", "billing"]);

        let stats = service.stats(&mailbox).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.count(Dimension::Category, "billing"), 2);
        assert_eq!(stats.count(Dimension::Department, "logistics"), 1);
        assert_eq!(stats.dimensions.len(), Dimension::ALL.len());

        let high = service.filter_by_priority(&mailbox, "high").await.unwrap();
        assert_eq!(high.len(), 2);
        assert!(high.iter().all(|item| item.analysis.priority == "high"));

        let logistics = service
            .filter_by_department(&mailbox, "logistics")
            .await
            .unwrap();
        assert_eq!(logistics.len(), 1);
        assert_eq!(logistics[0].message.subject.as_deref(), Some("Late"));

        assert!(service
            .filter_by_department(&mailbox, "Logistics")
            .await
            .unwrap()
            .is_empty());

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn empty_buffer_is_distinct_from_unknown_mailbox() {
        let transport = ScriptedTransport::default();
        let service = service(&transport);
        let mailbox = service
            .start_poll(request("alice@example.com"), "pw")
            .await
            .mailbox;

        let stats = service.stats(&mailbox).await.unwrap();
        assert_eq!(stats.total, 0);
        assert!(service.analyze_buffered(&mailbox).await.unwrap().is_empty());

        let unknown = MailboxId::new("nobody");
        assert!(matches!(
            service.list_buffered(&unknown).await,
            Err(Error::UnknownMailbox(_))
        ));
        assert!(matches!(
            service.stats(&unknown).await,
            Err(Error::UnknownMailbox(_))
        ));

        service.stop_poll(&mailbox).await.unwrap();
        assert_eq!(service.poller_status(&mailbox).await, PollerState::Idle);
        assert!(service.active_pollers().await.is_empty());
    }

    #[tokio::test]
    async fn untrained_model_fails_queries() {
        let transport = ScriptedTransport::with_messages(vec![message("hi", "hello")]);
        let service = MailService::new(
            Arc::new(ClassificationModel::untrained()),
            Arc::new(transport.clone()),
            config(),
        );

        assert!(matches!(
            service.analyze_text("hello"),
            Err(Error::Classify(ClassifyError::Untrained))
        ));

        let mailbox = service
            .start_poll(request("alice@example.com"), "pw")
            .await
            .mailbox;
        wait_for_records(&service, &mailbox, 1).await;
        assert!(matches!(
            service.analyze_buffered(&mailbox).await,
            Err(Error::Classify(ClassifyError::Untrained))
        ));

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn secret_refs_start_pollers() {
        let transport = ScriptedTransport::default();
        transport.reject_password("wrong");

        let without_secrets = service(&transport);
        assert!(matches!(
            without_secrets
                .start_poll_with_secret(request("alice@example.com"), "AAAA")
                .await,
            Err(Error::Secret(_))
        ));

        let secrets = AesGcmSecrets::from_base64_key(&AesGcmSecrets::generate_key()).unwrap();
        let secret_ref = secrets.encrypt("app-password").unwrap();
        let service = service(&transport).with_secrets(Arc::new(secrets));

        let started = service
            .start_poll_with_secret(request("alice@example.com"), &secret_ref)
            .await
            .unwrap();
        assert_eq!(started.status, PollStatus::Started);
        assert!(service
            .start_poll_with_secret(request("bob@example.com"), "garbage")
            .await
            .is_err());

        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn stored_messages_are_analyzed() {
        let transport = ScriptedTransport::with_messages(vec![
            message("Refund", "charged twice on the invoice, refund my payment"),
            message("Damaged", ""),
        ]);
        let store = SqliteMessageStore::connect("sqlite::memory:").await.unwrap();
        let service = service(&transport).with_store(store);

        assert!(service.list_stored("owner-1").await.unwrap().is_empty());

        let credential = service.credential(None, "alice@example.com", "pw");
        let stored = service.ingest("owner-1", &credential).await.unwrap();
        assert_eq!(stored.len(), 2);

        let analyzed = service.analyze_stored("owner-1").await.unwrap();
        assert_eq!(analyzed.len(), 2);
        let refund = analyzed
            .iter()
            .find(|item| item.message.record.subject.as_deref() == Some("Refund"))
            .unwrap();
        assert_eq!(refund.analysis.category, "billing");
        assert_eq!(refund.analysis.action_required, "route_finance");

        assert!(service.mark_read("owner-1", stored[0].id).await.unwrap());
    }

    #[tokio::test]
    async fn store_operations_require_a_store() {
        let transport = ScriptedTransport::default();
        let service = service(&transport);
        assert!(matches!(
            service.list_stored("owner-1").await,
            Err(Error::Config(_))
        ));
    }
}
