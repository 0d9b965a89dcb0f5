//! Per-part acknowledgement tracking.
//!
//! When a part is transmitted the dispatcher registers two [`PartTicket`]s,
//! one per [`PartEventKind`]. The transport later reports each ticket's token.
//! A message moves `Pending -> Sent` once every part has reported sent, and
//! `Sent -> Delivered` once every part has reported delivered.
//!
//! Acknowledgements that arrive without a registered ticket (for example after
//! a restart) are still counted, using the part total the transport reports.
//! The dispatcher calls [`ReceiptTracker::prune`] at the start of every cycle
//! so tracking for settled or long-silent messages does not accumulate.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::dispatch::DispatchError;
use crate::message::MessageStatus;
use crate::status::StatusMachine;
use crate::token::CorrelationToken;
use crate::transport::TransportEvent;

/// Which acknowledgement a ticket is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartEventKind {
    /// The part left the device/bridge.
    Sent,
    /// The part reached the handset.
    Delivered,
}

impl PartEventKind {
    /// Returns the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Delivered => "delivered",
        }
    }
}

/// Routing data attached to one asynchronous transport callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartTicket {
    /// Token the transport reports back.
    pub token: CorrelationToken,
    /// Event this ticket is waiting for.
    pub kind: PartEventKind,
    /// Owning message.
    pub message_id: String,
    /// 0-based part index.
    pub part_index: u32,
    /// Number of parts in the message.
    pub total_parts: u32,
}

/// Result of feeding one acknowledgement to the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// No ticket is registered under the token.
    UnknownToken,
    /// The part index is not within the message's part count.
    OutOfRange,
    /// This part had already reported this event.
    Duplicate,
    /// Counted; other parts are still outstanding.
    Recorded {
        /// Parts still waiting for this event.
        remaining: u32,
    },
    /// Last part reported and the message moved to `status`.
    Completed {
        /// The message's new status.
        status: MessageStatus,
    },
    /// Last part reported but the message was no longer in the expected
    /// status (already failed or advanced elsewhere).
    Stale,
}

#[derive(Debug)]
struct Progress {
    total: u32,
    sent: HashSet<u32>,
    delivered: HashSet<u32>,
    tracked_since: Instant,
}

impl Progress {
    fn new(total: u32) -> Self {
        Self {
            total,
            sent: HashSet::new(),
            delivered: HashSet::new(),
            tracked_since: Instant::now(),
        }
    }

    fn reported(&mut self, kind: PartEventKind) -> &mut HashSet<u32> {
        match kind {
            PartEventKind::Sent => &mut self.sent,
            PartEventKind::Delivered => &mut self.delivered,
        }
    }
}

/// Correlates transport acknowledgements with messages and drives the
/// `Sent`/`Delivered` transitions.
///
/// Uses sync [`Mutex`]es since no critical section awaits.
#[derive(Debug)]
pub struct ReceiptTracker {
    status: StatusMachine,
    tickets: Mutex<HashMap<CorrelationToken, PartTicket>>,
    progress: Mutex<HashMap<String, Progress>>,
}

impl ReceiptTracker {
    /// Create a tracker that applies transitions through `status`.
    pub fn new(status: StatusMachine) -> Self {
        Self {
            status,
            tickets: Mutex::new(HashMap::new()),
            progress: Mutex::new(HashMap::new()),
        }
    }

    /// Register a ticket handed to the transport.
    ///
    /// A token collision replaces the older ticket.
    pub fn register(&self, ticket: PartTicket) {
        if let Ok(mut progress) = self.progress.lock() {
            progress
                .entry(ticket.message_id.clone())
                .or_insert_with(|| Progress::new(ticket.total_parts));
        }
        if let Ok(mut tickets) = self.tickets.lock() {
            if let Some(previous) = tickets.insert(ticket.token, ticket) {
                warn!(
                    token = %previous.token,
                    message_id = %previous.message_id,
                    "correlation token collision, older ticket dropped"
                );
            }
        }
    }

    /// Number of tickets waiting for an acknowledgement.
    pub fn pending_tickets(&self) -> usize {
        self.tickets.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Parts of `message_id` still waiting for `kind`, if the message is tracked.
    pub fn outstanding(&self, message_id: &str, kind: PartEventKind) -> Option<u32> {
        let mut progress = self.progress.lock().ok()?;
        let entry = progress.get_mut(message_id)?;
        let total = entry.total;
        let reported = u32::try_from(entry.reported(kind).len()).unwrap_or(u32::MAX);
        Some(total.saturating_sub(reported))
    }

    /// Drop every ticket and counter for `message_id`.
    pub fn forget(&self, message_id: &str) {
        if let Ok(mut progress) = self.progress.lock() {
            progress.remove(message_id);
        }
        if let Ok(mut tickets) = self.tickets.lock() {
            tickets.retain(|_, t| t.message_id != message_id);
        }
    }

    /// Number of messages with part counters.
    pub fn tracked_messages(&self) -> usize {
        self.progress.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Drop tracking for messages that no longer need acknowledgements.
    ///
    /// A message is dropped once its stored status has left `Pending`/`Sent`
    /// (or it no longer exists), or once it has been tracked for `max_age`.
    /// Returns the number of messages dropped.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Store`] if a status lookup fails; nothing
    /// past the failing message is dropped.
    pub async fn prune(&self, max_age: Duration) -> Result<usize, DispatchError> {
        let tracked: Vec<(String, bool)> = {
            let progress = self
                .progress
                .lock()
                .map_err(|e| DispatchError::Poisoned(e.to_string()))?;
            progress
                .iter()
                .map(|(id, p)| (id.clone(), p.tracked_since.elapsed() >= max_age))
                .collect()
        };

        let mut dropped: usize = 0;
        for (message_id, expired) in tracked {
            let settled = expired
                || !matches!(
                    self.status.current(&message_id).await?,
                    Some(MessageStatus::Pending | MessageStatus::Sent)
                );
            if settled {
                self.forget(&message_id);
                dropped = dropped.saturating_add(1);
            }
        }
        if dropped > 0 {
            debug!(dropped, "receipt tracking pruned");
        }
        Ok(dropped)
    }

    /// Resolve a token reported by the transport. Tokens are single-use.
    ///
    /// If the resulting transition fails the ticket is put back, so the same
    /// token can be reported again.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Store`] if a resulting transition fails.
    pub async fn acknowledge(&self, token: CorrelationToken) -> Result<AckOutcome, DispatchError> {
        let ticket = self.tickets.lock().ok().and_then(|mut t| t.remove(&token));
        let Some(ticket) = ticket else {
            debug!(%token, "acknowledgement for unknown token");
            return Ok(AckOutcome::UnknownToken);
        };
        let result = self
            .on_part_event(
                ticket.kind,
                &ticket.message_id,
                ticket.part_index,
                ticket.total_parts,
            )
            .await;
        if result.is_err() {
            if let Ok(mut tickets) = self.tickets.lock() {
                tickets.entry(ticket.token).or_insert(ticket);
            }
        }
        result
    }

    /// Record that part `part_index` of `message_id` reported `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Store`] if a resulting transition fails. The
    /// part is then not counted, so a retried report completes the message.
    pub async fn on_part_event(
        &self,
        kind: PartEventKind,
        message_id: &str,
        part_index: u32,
        total_parts: u32,
    ) -> Result<AckOutcome, DispatchError> {
        {
            let mut progress = self
                .progress
                .lock()
                .map_err(|e| DispatchError::Poisoned(e.to_string()))?;
            let entry = progress
                .entry(message_id.to_owned())
                .or_insert_with(|| Progress::new(total_parts));
            if part_index >= entry.total {
                warn!(
                    message_id,
                    part_index,
                    total = entry.total,
                    kind = kind.as_str(),
                    "acknowledgement for part outside message"
                );
                return Ok(AckOutcome::OutOfRange);
            }
            let total = entry.total;
            let reported = entry.reported(kind);
            if !reported.insert(part_index) {
                return Ok(AckOutcome::Duplicate);
            }
            let count = u32::try_from(reported.len()).unwrap_or(u32::MAX);
            let remaining = total.saturating_sub(count);
            if remaining > 0 {
                debug!(message_id, part_index, remaining, kind = kind.as_str(), "part acknowledged");
                return Ok(AckOutcome::Recorded { remaining });
            }
        }

        let applied = match self.complete(kind, message_id).await {
            Ok(applied) => applied,
            Err(e) => {
                self.unreport(kind, message_id, part_index);
                return Err(e);
            }
        };

        if !applied {
            self.forget(message_id);
            debug!(message_id, kind = kind.as_str(), "all parts reported but status moved on");
            return Ok(AckOutcome::Stale);
        }

        let status = match kind {
            PartEventKind::Sent => MessageStatus::Sent,
            PartEventKind::Delivered => {
                self.forget(message_id);
                MessageStatus::Delivered
            }
        };
        info!(message_id, status = %status, "all parts acknowledged");
        Ok(AckOutcome::Completed { status })
    }

    async fn complete(&self, kind: PartEventKind, message_id: &str) -> Result<bool, DispatchError> {
        match kind {
            PartEventKind::Sent => {
                self.status
                    .transition_id(message_id, MessageStatus::Pending, MessageStatus::Sent)
                    .await
            }
            PartEventKind::Delivered => {
                // Delivery implies sending; catch up if sent reports are missing.
                self.status
                    .transition_id(message_id, MessageStatus::Pending, MessageStatus::Sent)
                    .await?;
                self.status
                    .transition_id(message_id, MessageStatus::Sent, MessageStatus::Delivered)
                    .await
            }
        }
    }

    fn unreport(&self, kind: PartEventKind, message_id: &str, part_index: u32) {
        if let Ok(mut progress) = self.progress.lock() {
            if let Some(entry) = progress.get_mut(message_id) {
                entry.reported(kind).remove(&part_index);
            }
        }
    }

    /// Feed one event reported by the transport.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Store`] if a resulting transition fails.
    pub async fn apply(&self, event: TransportEvent) -> Result<(), DispatchError> {
        match event {
            TransportEvent::Ack { token } => {
                let outcome = self.acknowledge(CorrelationToken(token)).await?;
                trace!(token = %CorrelationToken(token), ?outcome, "acknowledgement applied");
            }
            TransportEvent::Part {
                kind,
                message_id,
                part_index,
                total_parts,
            } => {
                let outcome = self
                    .on_part_event(kind, &message_id, part_index, total_parts)
                    .await?;
                trace!(%message_id, part_index, ?outcome, "part event applied");
            }
            TransportEvent::PartFailed {
                message_id,
                part_index,
                reason,
            } => self.on_part_failed(&message_id, part_index, &reason).await?,
        }
        Ok(())
    }

    /// Record a transport-reported failure for one part.
    ///
    /// The whole message is marked failed; its outstanding tickets are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Store`] if the store fails.
    pub async fn on_part_failed(
        &self,
        message_id: &str,
        part_index: u32,
        reason: &str,
    ) -> Result<(), DispatchError> {
        self.forget(message_id);
        warn!(message_id, part_index, reason, "transport reported part failure");
        self.status
            .mark_failed_id(message_id, &format!("part {part_index}: {reason}"))
            .await
    }
}

/// Apply transport events to `receipts` until the channel closes.
///
/// A failed event is logged and dropped; for token acknowledgements the
/// ticket stays registered, so the transport can report it again.
pub async fn run_receipt_loop(
    receipts: Arc<ReceiptTracker>,
    mut event_rx: mpsc::Receiver<TransportEvent>,
) {
    info!("receipt loop started");
    while let Some(event) = event_rx.recv().await {
        if let Err(e) = receipts.apply(event).await {
            warn!(error = %e, kind = e.kind(), "failed to apply transport event");
        }
    }
    info!("receipt loop stopped");
}
