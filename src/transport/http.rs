//! HTTP client for an SMS bridge sidecar.
//!
//! The bridge owns the modem or carrier connection. It exposes `POST /send`
//! for a single part and `POST /divide` for native splitting. Acknowledgements
//! come back by correlation token on `GET /events/poll` (see [`super::events`]).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Transport, TransportError};
use crate::receipts::PartTicket;

/// Default bridge base URL.
pub const DEFAULT_BRIDGE_URL: &str = "http://127.0.0.1:3002";

/// Client for the SMS bridge.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

/// Body of a `POST /send` request.
#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    to: &'a str,
    smsc: Option<&'a str>,
    text: &'a str,
    message_id: &'a str,
    part_index: u32,
    total_parts: u32,
    sent_token: u64,
    delivered_token: u64,
}

/// Response envelope from the bridge HTTP API.
#[derive(Deserialize)]
struct BridgeResponse<T> {
    data: Option<T>,
    error: Option<String>,
}

impl HttpTransport {
    /// Create a client for `base_url` with the given timeouts.
    pub fn new(base_url: String, connect_timeout: Duration, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    /// Bridge base URL, without trailing slash.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn rejected(resp: reqwest::Response) -> TransportError {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        TransportError::Rejected { status, body }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn transmit(
        &self,
        destination: &str,
        smsc: Option<&str>,
        part_text: &str,
        on_sent: &PartTicket,
        on_delivered: &PartTicket,
    ) -> Result<(), TransportError> {
        let url = format!("{}/send", self.base_url);
        let body = SendRequest {
            to: destination,
            smsc,
            text: part_text,
            message_id: &on_sent.message_id,
            part_index: on_sent.part_index,
            total_parts: on_sent.total_parts,
            sent_token: on_sent.token.0,
            delivered_token: on_delivered.token.0,
        };
        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(Self::rejected(resp).await);
        }
        debug!(
            message_id = %on_sent.message_id,
            part = on_sent.part_index,
            total = on_sent.total_parts,
            "part handed to bridge"
        );
        Ok(())
    }

    async fn native_split(&self, body: &str) -> Result<Vec<String>, TransportError> {
        let url = format!("{}/divide", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "text": body }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::rejected(resp).await);
        }
        let envelope: BridgeResponse<Vec<String>> = resp.json().await?;
        envelope.data.ok_or_else(|| {
            TransportError::Unavailable(
                envelope
                    .error
                    .unwrap_or_else(|| "bridge returned no parts".to_owned()),
            )
        })
    }
}
