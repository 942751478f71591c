//! Durable message storage (SQLite).

use crate::MessageRecord;
use crate::error::Result;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr as _;
use std::sync::Arc;

/// A persisted message with its ownership and read state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub owner: String,
    #[serde(flatten)]
    pub record: MessageRecord,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
}

/// Persistence capability for the durable ingestion path.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn store(&self, record: &MessageRecord, owner: &str) -> Result<StoredMessage>;

    /// Newest first; ties keep the most recently stored first.
    async fn list_stored(&self, owner: &str) -> Result<Vec<StoredMessage>>;

    /// Returns whether a matching unread message was updated.
    async fn mark_read(&self, owner: &str, id: i64) -> Result<bool>;
}

pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteMessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteMessageStore")
            .field("pool", &"<SqlitePool>")
            .finish()
    }
}

impl SqliteMessageStore {
    /// Open (creating if needed) the database and apply migrations.
    pub async fn connect(database_url: &str) -> Result<Arc<Self>> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid database url '{database_url}'"))?
            .create_if_missing(true);

        // Each connection to an in-memory database is a separate database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database '{database_url}'"))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run database migrations")?;

        Ok(Arc::new(Self { pool }))
    }
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn store(&self, record: &MessageRecord, owner: &str) -> Result<StoredMessage> {
        let received_at = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO messages (owner, sender, recipient, subject, date, body, received_at, is_read)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(owner)
        .bind(&record.sender)
        .bind(&record.recipient)
        .bind(&record.subject)
        .bind(&record.date)
        .bind(&record.body)
        .bind(received_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to store message for {owner}"))?;

        let stored = StoredMessage {
            id: result.last_insert_rowid(),
            owner: owner.to_string(),
            record: record.clone(),
            received_at,
            is_read: false,
        };
        tracing::debug!(id = stored.id, owner, "stored message");

        Ok(stored)
    }

    async fn list_stored(&self, owner: &str) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner, sender, recipient, subject, date, body, received_at, is_read
            FROM messages
            WHERE owner = ?
            ORDER BY received_at DESC, id DESC
            "#,
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to list messages for {owner}"))?;

        let messages = rows
            .iter()
            .map(row_to_stored_message)
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(messages)
    }

    async fn mark_read(&self, owner: &str, id: i64) -> Result<bool> {
        let result =
            sqlx::query("UPDATE messages SET is_read = 1 WHERE id = ? AND owner = ? AND is_read = 0")
                .bind(id)
                .bind(owner)
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to mark message {id} read"))?;

        Ok(result.rows_affected() > 0)
    }
}

fn row_to_stored_message(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        record: MessageRecord {
            subject: row.try_get("subject")?,
            sender: row.try_get("sender")?,
            recipient: row.try_get("recipient")?,
            date: row.try_get("date")?,
            body: row.try_get("body")?,
        },
        received_at: row.try_get("received_at")?,
        is_read: row.try_get("is_read")?,
    })
}
