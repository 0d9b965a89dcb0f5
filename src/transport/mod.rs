//! SMS transport abstraction.
//!
//! A [`Transport`] hands one part at a time to the network and later reports
//! per-part results by correlation token (see [`events`] and
//! [`crate::receipts`]). The transmit call returns as soon as the part is
//! queued; it never waits for network acknowledgement.

pub mod events;
pub mod http;

use async_trait::async_trait;

use crate::receipts::PartTicket;

pub use events::{spawn_event_listener, TransportEvent};
pub use http::HttpTransport;

/// Errors raised by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// HTTP request to the transport failed.
    #[error("transport request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The transport answered but refused the request.
    #[error("transport rejected request ({status}): {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The transport cannot take traffic right now.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Transmits text to a destination and splits bodies natively.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue a single part for transmission.
    ///
    /// `smsc` overrides the service centre; `None` uses the transport default.
    /// The transport reports `on_sent.token` once the part leaves and
    /// `on_delivered.token` once it is delivered.
    async fn transmit(
        &self,
        destination: &str,
        smsc: Option<&str>,
        part_text: &str,
        on_sent: &PartTicket,
        on_delivered: &PartTicket,
    ) -> Result<(), TransportError>;

    /// Split `body` using the transport's own multipart rules.
    async fn native_split(&self, body: &str) -> Result<Vec<String>, TransportError>;
}
