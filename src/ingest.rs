//! Durable ingestion: one fetch cycle written straight to the message store.

use crate::error::Result;
use crate::mail::poller::fetch_cycle;
use crate::mail::transport::MailTransport;
use crate::store::{MessageStore, StoredMessage};
use crate::MailboxCredential;

/// Fetch new messages once and persist every parsed record for `owner`.
pub async fn ingest_unseen(
    transport: &dyn MailTransport,
    credential: &MailboxCredential,
    store: &dyn MessageStore,
    owner: &str,
) -> Result<Vec<StoredMessage>> {
    let records = fetch_cycle(transport, credential).await?;

    let mut stored = Vec::with_capacity(records.len());
    for record in &records {
        stored.push(store.store(record, owner).await?);
    }

    tracing::info!(owner, stored = stored.len(), "durable ingestion complete");
    Ok(stored)
}
