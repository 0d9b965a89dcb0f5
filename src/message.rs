//! Outbound message records and their delivery status.

use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// Delivery status of an outbound message.
///
/// The forward path is `Unsent -> Pending -> Sent -> Delivered`. `Failed` is
/// terminal and reachable from `Unsent` (invalid destination) or, through
/// [`crate::status::StatusMachine::mark_failed`], from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Queued by a composer, not yet claimed by a dispatch cycle.
    Unsent,
    /// Claimed by a dispatch cycle and handed to the transport.
    Pending,
    /// Every part was accepted by the network.
    Sent,
    /// Every part was reported delivered to the handset.
    Delivered,
    /// Dispatch gave up on this message.
    Failed,
}

impl MessageStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [MessageStatus; 5] = [
        Self::Unsent,
        Self::Pending,
        Self::Sent,
        Self::Delivered,
        Self::Failed,
    ];

    /// Returns the SQLite-stored string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsent => "unsent",
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    /// Parse a string into a message status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidEnum`] if the string is unrecognized.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "unsent" => Ok(Self::Unsent),
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::InvalidEnum {
                field: "status",
                value: other.to_owned(),
            }),
        }
    }

    /// Check if the status machine may move from `self` to `target`.
    ///
    /// Only `Unsent -> Failed` leads to `Failed` here; failing a message in
    /// any other status goes through `mark_failed`.
    pub fn can_transition_to(&self, target: MessageStatus) -> bool {
        matches!(
            (self, target),
            (Self::Unsent, MessageStatus::Pending)
                | (Self::Pending, MessageStatus::Sent)
                | (Self::Sent, MessageStatus::Delivered)
                | (Self::Unsent, MessageStatus::Failed)
        )
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// A message queued for delivery through the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Opaque, stable identifier.
    pub id: String,
    /// Destination address (phone number).
    pub destination: String,
    /// Message text. May exceed a single part.
    pub body: String,
    /// Current delivery status.
    pub status: MessageStatus,
    /// Set if and only if `status` is [`MessageStatus::Failed`].
    pub failure_reason: Option<String>,
    /// When the store first saw the message.
    pub created_at: Option<String>,
    /// When the status last changed.
    pub status_updated_at: Option<String>,
}

impl OutboundMessage {
    /// Build a fresh `Unsent` message with a generated id.
    pub fn new(destination: impl Into<String>, body: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), destination, body)
    }

    /// Build a fresh `Unsent` message with a caller-chosen id.
    pub fn with_id(
        id: impl Into<String>,
        destination: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            destination: destination.into(),
            body: body.into(),
            status: MessageStatus::Unsent,
            failure_reason: None,
            created_at: None,
            status_updated_at: None,
        }
    }
}

impl std::fmt::Display for OutboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] to={} len={}",
            self.id,
            self.status,
            self.destination,
            self.body.chars().count()
        )
    }
}
