//! Message status state machine.
//!
//! All status changes go through [`StatusMachine`]. Forward transitions are
//! compare-and-set operations against the store, so two dispatch cycles racing
//! on the same message cannot both win. Failure is unconditional and always
//! carries a reason.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::dispatch::DispatchError;
use crate::message::{MessageStatus, OutboundMessage};
use crate::store::{MessageStore, StoreError};

/// Enforces legal status transitions against a [`MessageStore`].
#[derive(Clone)]
pub struct StatusMachine {
    store: Arc<dyn MessageStore>,
}

impl std::fmt::Debug for StatusMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusMachine").finish_non_exhaustive()
    }
}

impl StatusMachine {
    /// Create a status machine over `store`.
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Move `message` from `expected` to `new` if its persisted status is
    /// still `expected`.
    ///
    /// Returns `Ok(false)` when another writer got there first; nothing is
    /// changed in that case. On success `message` is updated in place.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::IllegalTransition`] for edges outside the
    /// lifecycle (including any edge into `Failed`, which needs a reason and
    /// goes through [`StatusMachine::mark_failed`]), or
    /// [`DispatchError::Store`] if the store fails.
    pub async fn transition(
        &self,
        message: &mut OutboundMessage,
        expected: MessageStatus,
        new: MessageStatus,
    ) -> Result<bool, DispatchError> {
        let applied = self.transition_id(&message.id, expected, new).await?;
        if applied {
            message.status = new;
            message.failure_reason = None;
        }
        Ok(applied)
    }

    /// [`StatusMachine::transition`] for callers holding only the id.
    ///
    /// # Errors
    ///
    /// Same as [`StatusMachine::transition`].
    pub async fn transition_id(
        &self,
        message_id: &str,
        expected: MessageStatus,
        new: MessageStatus,
    ) -> Result<bool, DispatchError> {
        if new == MessageStatus::Failed || !expected.can_transition_to(new) {
            return Err(DispatchError::IllegalTransition { from: expected, to: new });
        }

        let applied = self
            .store
            .compare_and_set_status(message_id, expected, new)
            .await?;
        if applied {
            trace!(message_id, from = %expected, to = %new, "status updated");
        } else {
            debug!(message_id, from = %expected, to = %new, "status not {expected}, transition skipped");
        }
        Ok(applied)
    }

    /// Persisted status of `message_id`, or `None` if the store has no such
    /// message.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Store`] if the store fails.
    pub async fn current(&self, message_id: &str) -> Result<Option<MessageStatus>, DispatchError> {
        match self.store.get_message(message_id).await {
            Ok(message) => Ok(Some(message.status)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Mark `message` failed with `reason`, whatever its current status.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Store`] if the store fails.
    pub async fn mark_failed(
        &self,
        message: &mut OutboundMessage,
        reason: &str,
    ) -> Result<(), DispatchError> {
        self.mark_failed_id(&message.id, reason).await?;
        message.status = MessageStatus::Failed;
        message.failure_reason = Some(reason.to_owned());
        Ok(())
    }

    /// [`StatusMachine::mark_failed`] for callers holding only the id.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Store`] if the store fails.
    pub async fn mark_failed_id(&self, message_id: &str, reason: &str) -> Result<(), DispatchError> {
        self.store.set_failed(message_id, reason).await?;
        debug!(message_id, reason, "message failed");
        Ok(())
    }
}
