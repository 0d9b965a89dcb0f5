//! Acknowledgement stream from the SMS bridge.
//!
//! The bridge queues per-part results and serves them from its
//! `/events/poll` long-polling endpoint. The listener forwards every event to
//! an mpsc channel; [`crate::receipts::run_receipt_loop`] applies them.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::TransportError;
use crate::receipts::PartEventKind;

/// One result reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    /// A correlation token handed out with a part came back.
    Ack {
        /// The reported token.
        token: u64,
    },
    /// A part reported by position rather than by token.
    Part {
        /// Which acknowledgement arrived.
        kind: PartEventKind,
        /// Owning message.
        message_id: String,
        /// 0-based part index.
        part_index: u32,
        /// Number of parts in the message.
        total_parts: u32,
    },
    /// The transport gave up on a part.
    PartFailed {
        /// Owning message.
        message_id: String,
        /// 0-based part index.
        part_index: u32,
        /// Transport-supplied reason.
        reason: String,
    },
}

/// Long-poll timeout for the HTTP client (seconds).
const POLL_TIMEOUT_SECS: u64 = 60;

/// Pause after a non-success poll response.
const REJECTED_POLL_PAUSE: Duration = Duration::from_secs(5);

const INITIAL_BACKOFF_MS: u64 = 1_000;
const MAX_BACKOFF_MS: u64 = 30_000;

/// Spawn a listener that forwards bridge events to `event_tx`.
///
/// Reconnects with exponential backoff on network errors. Stops when
/// shutdown is signalled or the receiving side of `event_tx` is dropped.
pub fn spawn_event_listener(
    base_url: &str,
    event_tx: mpsc::Sender<TransportEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let poll_url = format!("{}/events/poll", base_url.trim_end_matches('/'));
    tokio::spawn(async move {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build event poll client, using default");
                reqwest::Client::default()
            });
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            info!(url = %poll_url, "connecting to transport event stream");
            let result = tokio::select! {
                result = poll_events(&client, &poll_url, &event_tx) => result,
                _ = shutdown_rx.changed() => break,
            };

            match result {
                Ok(()) => {
                    info!("transport event receiver closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, backoff_ms, "transport event stream error, reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                    backoff_ms = backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
                }
            }
        }
        info!("transport event listener stopped");
    })
}

/// Poll until the channel closes. Returns `Err` on network errors other
/// than the long-poll timeout.
async fn poll_events(
    client: &reqwest::Client,
    poll_url: &str,
    event_tx: &mpsc::Sender<TransportEvent>,
) -> Result<(), TransportError> {
    loop {
        match client.get(poll_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<Vec<TransportEvent>>().await {
                    Ok(events) => {
                        for event in events {
                            debug!(?event, "transport event received");
                            if event_tx.send(event).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "undecodable transport event batch dropped"),
                }
            }
            Ok(resp) => {
                debug!(status = %resp.status(), "event poll returned non-success");
                tokio::time::sleep(REJECTED_POLL_PAUSE).await;
            }
            Err(e) if e.is_timeout() => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
