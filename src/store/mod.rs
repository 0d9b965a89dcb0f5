//! Message persistence.
//!
//! The dispatch pipeline never touches storage directly; it goes through the
//! [`MessageStore`] trait. Every status mutation except [`MessageStore::set_failed`]
//! is a compare-and-set so overlapping dispatch cycles cannot lose updates.
//!
//! Two implementations ship with the crate:
//! - [`sqlite::SqliteMessageStore`]: SQLite via sqlx, WAL mode
//! - [`memory::MemoryMessageStore`]: in-process, for tests and dummy load runs

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::message::{MessageStatus, OutboundMessage};

pub use memory::MemoryMessageStore;
pub use sqlite::SqliteMessageStore;

/// Errors from the message store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored enum column held an unknown value.
    #[error("invalid {field} value: {value}")]
    InvalidEnum {
        /// Column name.
        field: &'static str,
        /// The unrecognized value.
        value: String,
    },

    /// The requested message does not exist.
    #[error("message not found: {0}")]
    NotFound(String),

    /// An in-process lock was poisoned by a panicking holder.
    #[error("store lock poisoned: {0}")]
    Poisoned(String),
}

/// An informational entry in the gateway's event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayEvent {
    /// Event text.
    pub message: String,
    /// When the event was written.
    pub logged_at: String,
}

/// Storage collaborator for outbound messages.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Fetch up to `limit` messages currently in `status`, oldest first.
    async fn get_messages(
        &self,
        limit: u32,
        status: MessageStatus,
    ) -> Result<Vec<OutboundMessage>, StoreError>;

    /// Atomically move `message_id` from `expected` to `new`.
    ///
    /// Returns `false` without mutating anything when the persisted status is
    /// not `expected` (including when the message does not exist).
    async fn compare_and_set_status(
        &self,
        message_id: &str,
        expected: MessageStatus,
        new: MessageStatus,
    ) -> Result<bool, StoreError>;

    /// Unconditionally mark `message_id` as failed with `reason`.
    async fn set_failed(&self, message_id: &str, reason: &str) -> Result<(), StoreError>;

    /// Queue a new message. Its status is stored as given.
    async fn insert_message(&self, message: &OutboundMessage) -> Result<(), StoreError>;

    /// Load a single message by id.
    async fn get_message(&self, message_id: &str) -> Result<OutboundMessage, StoreError>;

    /// Count messages per status, in [`MessageStatus::ALL`] order.
    async fn count_by_status(&self) -> Result<Vec<(MessageStatus, u64)>, StoreError>;

    /// Append an informational entry to the gateway event log.
    async fn log_event(&self, message: &str) -> Result<(), StoreError>;

    /// Most recent event log entries, newest first.
    async fn recent_events(&self, limit: u32) -> Result<Vec<GatewayEvent>, StoreError>;
}
