//! Dispatch orchestration.
//!
//! A cycle pulls a bounded batch of `Unsent` messages and, for each one,
//! claims it, validates the destination, segments the body and hands every
//! part to the transport with a pair of correlation tickets. Each message is
//! processed in isolation: whatever goes wrong with one is recorded as a
//! failure on that message and the batch carries on.
//!
//! Cycles may overlap. The claim is a compare-and-set, so a cycle that loses
//! the race on a message just skips it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::address::{AddressValidator, GlobalPhoneNumber};
use crate::config::GatewayConfig;
use crate::message::{MessageStatus, OutboundMessage};
use crate::receipts::{PartEventKind, PartTicket, ReceiptTracker};
use crate::segment::{segment, MessagePart, Segmentation};
use crate::status::StatusMachine;
use crate::store::{MessageStore, StoreError};
use crate::token::{RandomTokens, TokenSource};
use crate::transport::{Transport, TransportError};

/// Failure reason recorded for destinations that fail validation.
pub const INVALID_DESTINATION: &str = "destination.invalid";

/// Default for [`DispatchSettings::receipt_ttl`]: one day.
pub const DEFAULT_RECEIPT_TTL_SECS: u64 = 86_400;

/// Errors from the dispatch pipeline.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The message store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The requested status change is not a lifecycle edge.
    #[error("illegal status transition: {from} -> {to}")]
    IllegalTransition {
        /// Status the caller expected.
        from: MessageStatus,
        /// Status the caller asked for.
        to: MessageStatus,
    },

    /// An in-process lock was poisoned.
    #[error("lock poisoned: {0}")]
    Poisoned(String),
}

impl DispatchError {
    /// Stable label for the error variant, recorded in failure reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store(_) => "StoreError",
            Self::Transport(_) => "TransportError",
            Self::IllegalTransition { .. } => "IllegalTransition",
            Self::Poisoned(_) => "Poisoned",
        }
    }
}

/// Format the failure reason stored for a message whose dispatch errored.
pub fn failure_reason(err: &DispatchError) -> String {
    let mut causes = Vec::new();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        causes.push(cause.to_string());
        source = cause.source();
    }
    let cause = if causes.is_empty() {
        "none".to_owned()
    } else {
        causes.join(" <- ")
    };
    format!("Exception: {}; message: {err}; cause: {cause}", err.kind())
}

/// Per-cycle settings resolved from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Maximum messages pulled per cycle.
    pub batch_limit: u32,
    /// How bodies are split.
    pub segmentation: Segmentation,
    /// Skip transmission and walk messages straight to delivered.
    pub dummy_send_mode: bool,
    /// Service centre override passed to the transport.
    pub smsc: Option<String>,
    /// How long a message's acknowledgement tracking may stay open.
    pub receipt_ttl: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            batch_limit: 10,
            segmentation: Segmentation::Native,
            dummy_send_mode: false,
            smsc: None,
            receipt_ttl: Duration::from_secs(DEFAULT_RECEIPT_TTL_SECS),
        }
    }
}

impl DispatchSettings {
    /// Resolve settings from the gateway config.
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            batch_limit: config.dispatch.batch_limit,
            segmentation: Segmentation::from_compat_flag(config.dispatch.compatibility_segmentation),
            dummy_send_mode: config.dispatch.dummy_send_mode,
            smsc: config.transport.smsc.clone(),
            receipt_ttl: Duration::from_secs(config.dispatch.receipt_ttl_secs),
        }
    }
}

/// What happened to one message in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Every part was handed to the transport.
    Dispatched {
        /// Number of parts transmitted.
        parts: usize,
    },
    /// Another cycle had already claimed the message.
    Skipped,
    /// The destination failed validation; the message is now failed.
    InvalidDestination,
    /// Dummy mode walked the message to delivered.
    Simulated,
    /// Dispatch errored; the message is now failed.
    Failed,
}

/// Aggregate result of one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Messages pulled from the store.
    pub fetched: usize,
    /// Messages handed to the transport (or simulated).
    pub dispatched: usize,
    /// Messages claimed by another cycle first.
    pub skipped: usize,
    /// Messages that ended the cycle failed.
    pub failed: usize,
    /// Parts handed to the transport.
    pub parts_sent: usize,
}

impl DispatchSummary {
    fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Dispatched { parts } => {
                self.dispatched = self.dispatched.saturating_add(1);
                self.parts_sent = self.parts_sent.saturating_add(parts);
            }
            MessageOutcome::Simulated => self.dispatched = self.dispatched.saturating_add(1),
            MessageOutcome::Skipped => self.skipped = self.skipped.saturating_add(1),
            MessageOutcome::InvalidDestination | MessageOutcome::Failed => {
                self.failed = self.failed.saturating_add(1);
            }
        }
    }
}

/// Drives unsent messages through segmentation and transmission.
pub struct Dispatcher {
    store: Arc<dyn MessageStore>,
    status: StatusMachine,
    transport: Arc<dyn Transport>,
    validator: Arc<dyn AddressValidator>,
    tokens: Arc<dyn TokenSource>,
    receipts: Arc<ReceiptTracker>,
    settings: DispatchSettings,
}

impl Dispatcher {
    /// Create a dispatcher with global phone number validation and random
    /// correlation tokens.
    pub fn new(
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn Transport>,
        settings: DispatchSettings,
    ) -> Self {
        let status = StatusMachine::new(Arc::clone(&store));
        let receipts = Arc::new(ReceiptTracker::new(status.clone()));
        Self {
            store,
            status,
            transport,
            validator: Arc::new(GlobalPhoneNumber),
            tokens: Arc::new(RandomTokens::new()),
            receipts,
            settings,
        }
    }

    /// Replace the destination validator.
    pub fn with_validator(mut self, validator: Arc<dyn AddressValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Replace the correlation token source.
    pub fn with_tokens(mut self, tokens: Arc<dyn TokenSource>) -> Self {
        self.tokens = tokens;
        self
    }

    /// Tracker the transport's acknowledgements should be fed into.
    pub fn receipts(&self) -> Arc<ReceiptTracker> {
        Arc::clone(&self.receipts)
    }

    /// Settings this dispatcher runs with.
    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Run one dispatch cycle.
    ///
    /// # Errors
    ///
    /// Only fails if the batch cannot be fetched. Errors while handling an
    /// individual message are recorded on that message instead.
    pub async fn dispatch_pending(&self) -> Result<DispatchSummary, DispatchError> {
        if let Err(e) = self.receipts.prune(self.settings.receipt_ttl).await {
            warn!(error = %e, "failed to prune receipt tracking");
        }

        let batch = self
            .store
            .get_messages(self.settings.batch_limit, MessageStatus::Unsent)
            .await?;

        let mut summary = DispatchSummary::default();
        if batch.is_empty() {
            self.log_event("No SMS waiting to be sent.").await;
            return Ok(summary);
        }

        summary.fetched = batch.len();
        self.log_event(&format!("Sending {} SMSs...", batch.len())).await;

        for mut message in batch {
            trace!(message = %message, "attempting to send");
            let result = if self.settings.dummy_send_mode {
                self.send_dummy(&mut message).await
            } else {
                self.send(&mut message).await
            };

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.fail_message(&mut message, &e).await;
                    MessageOutcome::Failed
                }
            };
            summary.record(outcome);
        }

        info!(
            fetched = summary.fetched,
            dispatched = summary.dispatched,
            skipped = summary.skipped,
            failed = summary.failed,
            parts = summary.parts_sent,
            "dispatch cycle complete"
        );
        Ok(summary)
    }

    async fn send(&self, message: &mut OutboundMessage) -> Result<MessageOutcome, DispatchError> {
        debug!(message_id = %message.id, to = %message.destination, "sending message");

        if !self
            .status
            .transition(message, MessageStatus::Unsent, MessageStatus::Pending)
            .await?
        {
            debug!(message_id = %message.id, "message claimed by another cycle");
            return Ok(MessageOutcome::Skipped);
        }

        if !self.validator.is_well_formed(&message.destination) {
            self.log_event(&format!(
                "Not sending SMS to '{}' because number appears invalid",
                message.destination
            ))
            .await;
            self.status.mark_failed(message, INVALID_DESTINATION).await?;
            return Ok(MessageOutcome::InvalidDestination);
        }

        let parts = segment(
            &message.body,
            self.settings.segmentation,
            self.transport.as_ref(),
        )
        .await?;

        for part in &parts {
            let on_sent = self.ticket(PartEventKind::Sent, message, part);
            let on_delivered = self.ticket(PartEventKind::Delivered, message, part);
            self.receipts.register(on_sent.clone());
            self.receipts.register(on_delivered.clone());

            self.transport
                .transmit(
                    &message.destination,
                    self.settings.smsc.as_deref(),
                    &part.text,
                    &on_sent,
                    &on_delivered,
                )
                .await?;
        }

        Ok(MessageOutcome::Dispatched { parts: parts.len() })
    }

    async fn send_dummy(
        &self,
        message: &mut OutboundMessage,
    ) -> Result<MessageOutcome, DispatchError> {
        debug!(message_id = %message.id, to = %message.destination, "dummy send");

        if !self
            .status
            .transition(message, MessageStatus::Unsent, MessageStatus::Pending)
            .await?
        {
            return Ok(MessageOutcome::Skipped);
        }
        for (from, to) in [
            (MessageStatus::Pending, MessageStatus::Sent),
            (MessageStatus::Sent, MessageStatus::Delivered),
        ] {
            if !self.status.transition(message, from, to).await? {
                debug!(message_id = %message.id, "dummy send overtaken by another writer");
                return Ok(MessageOutcome::Skipped);
            }
        }
        Ok(MessageOutcome::Simulated)
    }

    fn ticket(&self, kind: PartEventKind, message: &OutboundMessage, part: &MessagePart) -> PartTicket {
        PartTicket {
            token: self.tokens.issue(),
            kind,
            message_id: message.id.clone(),
            part_index: part.index,
            total_parts: part.total,
        }
    }

    async fn fail_message(&self, message: &mut OutboundMessage, err: &DispatchError) {
        error!(message = %message, error = %err, kind = err.kind(), "dispatch failed");
        self.receipts.forget(&message.id);
        let reason = failure_reason(err);
        if let Err(e) = self.status.mark_failed(message, &reason).await {
            error!(message_id = %message.id, error = %e, "failed to record dispatch failure");
        }
    }

    async fn log_event(&self, event: &str) {
        info!("{event}");
        if let Err(e) = self.store.log_event(event).await {
            warn!(error = %e, "failed to write gateway event");
        }
    }
}

/// Run dispatch cycles every `interval` until shutdown is signalled.
///
/// Exits when the shutdown signal is received or the watch channel closes.
pub async fn run_dispatch_loop(
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "dispatch loop started");
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = dispatcher.dispatch_pending().await {
                    error!(error = %e, "dispatch cycle failed");
                }
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("dispatch loop shutting down");
                    break;
                }
            }
        }
    }

    info!("dispatch loop stopped");
}
