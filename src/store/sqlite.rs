//! SQLite-backed message store.
//!
//! The schema is applied inline via `include_str!` on open. Status changes are
//! single `UPDATE ... WHERE status = ?` statements, so SQLite's row-level
//! atomicity provides the compare-and-set.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::trace;

use super::{GatewayEvent, MessageStore, StoreError};
use crate::message::{MessageStatus, OutboundMessage};

/// Row type returned by SQLite queries for outbound messages.
type MessageRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
);

const SELECT_COLUMNS: &str = "SELECT id, destination, body, status, failure_reason, \
     created_at, status_updated_at FROM outbound_messages";

const NOW: &str = "strftime('%Y-%m-%d %H:%M:%f', 'now')";

/// Message store persisted in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the database cannot be opened or
    /// the schema fails to apply.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Open a private in-memory database. Used by tests and dry runs.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the schema fails to apply.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);
        // A single connection keeps every query on the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, applying the schema if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the schema fails to apply.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let schema = include_str!("../../migrations/001_schema.sql");
        sqlx::raw_sql(schema).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Returns a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn message_from_row(row: MessageRow) -> Result<OutboundMessage, StoreError> {
    Ok(OutboundMessage {
        id: row.0,
        destination: row.1,
        body: row.2,
        status: MessageStatus::parse(&row.3)?,
        failure_reason: row.4,
        created_at: Some(row.5),
        status_updated_at: Some(row.6),
    })
}

#[async_trait]
impl MessageStore for SqliteMessageStore {
    async fn get_messages(
        &self,
        limit: u32,
        status: MessageStatus,
    ) -> Result<Vec<OutboundMessage>, StoreError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE status = ?1 ORDER BY created_at ASC, rowid ASC LIMIT ?2"
        );
        let rows: Vec<MessageRow> = sqlx::query_as(&sql)
            .bind(status.as_str())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(message_from_row).collect()
    }

    async fn compare_and_set_status(
        &self,
        message_id: &str,
        expected: MessageStatus,
        new: MessageStatus,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE outbound_messages SET status = ?1, failure_reason = NULL, \
             status_updated_at = {NOW} WHERE id = ?2 AND status = ?3"
        );
        let result = sqlx::query(&sql)
            .bind(new.as_str())
            .bind(message_id)
            .bind(expected.as_str())
            .execute(&self.pool)
            .await?;

        let applied = result.rows_affected() == 1;
        trace!(
            message_id,
            from = expected.as_str(),
            to = new.as_str(),
            applied,
            "compare-and-set status"
        );
        Ok(applied)
    }

    async fn set_failed(&self, message_id: &str, reason: &str) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE outbound_messages SET status = 'failed', failure_reason = ?1, \
             status_updated_at = {NOW} WHERE id = ?2"
        );
        let result = sqlx::query(&sql)
            .bind(reason)
            .bind(message_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(message_id.to_owned()));
        }
        trace!(message_id, reason, "message marked failed");
        Ok(())
    }

    async fn insert_message(&self, message: &OutboundMessage) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO outbound_messages (id, destination, body, status, failure_reason) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&message.id)
        .bind(&message.destination)
        .bind(&message.body)
        .bind(message.status.as_str())
        .bind(&message.failure_reason)
        .execute(&self.pool)
        .await?;

        trace!(message_id = %message.id, "message inserted");
        Ok(())
    }

    async fn get_message(&self, message_id: &str) -> Result<OutboundMessage, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
        let row: MessageRow = sqlx::query_as(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(message_id.to_owned()))?;

        message_from_row(row)
    }

    async fn count_by_status(&self) -> Result<Vec<(MessageStatus, u64)>, StoreError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, count(*) FROM outbound_messages GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts: Vec<(MessageStatus, u64)> =
            MessageStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for (status, count) in rows {
            let status = MessageStatus::parse(&status)?;
            if let Some(slot) = counts.iter_mut().find(|(s, _)| *s == status) {
                slot.1 = u64::try_from(count).unwrap_or(0);
            }
        }
        Ok(counts)
    }

    async fn log_event(&self, message: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO gateway_log (message) VALUES (?1)")
            .bind(message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recent_events(&self, limit: u32) -> Result<Vec<GatewayEvent>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT message, logged_at FROM gateway_log ORDER BY id DESC LIMIT ?1",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(message, logged_at)| GatewayEvent { message, logged_at })
            .collect())
    }
}
