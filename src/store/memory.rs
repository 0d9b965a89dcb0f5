//! In-process message store.
//!
//! Insertion order stands in for creation time. Uses sync [`Mutex`]es since
//! no critical section awaits.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::{GatewayEvent, MessageStore, StoreError};
use crate::message::{MessageStatus, OutboundMessage};

/// Message store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    messages: Mutex<Vec<OutboundMessage>>,
    events: Mutex<Vec<GatewayEvent>>,
}

fn now() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|e| StoreError::Poisoned(e.to_string()))
}

impl MemoryMessageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored message, in insertion order.
    pub fn snapshot(&self) -> Vec<OutboundMessage> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn get_messages(
        &self,
        limit: u32,
        status: MessageStatus,
    ) -> Result<Vec<OutboundMessage>, StoreError> {
        let messages = lock(&self.messages)?;
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(messages
            .iter()
            .filter(|m| m.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn compare_and_set_status(
        &self,
        message_id: &str,
        expected: MessageStatus,
        new: MessageStatus,
    ) -> Result<bool, StoreError> {
        let mut messages = lock(&self.messages)?;
        let Some(message) = messages
            .iter_mut()
            .find(|m| m.id == message_id && m.status == expected)
        else {
            return Ok(false);
        };
        message.status = new;
        message.failure_reason = None;
        message.status_updated_at = Some(now());
        Ok(true)
    }

    async fn set_failed(&self, message_id: &str, reason: &str) -> Result<(), StoreError> {
        let mut messages = lock(&self.messages)?;
        let message = messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| StoreError::NotFound(message_id.to_owned()))?;
        message.status = MessageStatus::Failed;
        message.failure_reason = Some(reason.to_owned());
        message.status_updated_at = Some(now());
        Ok(())
    }

    async fn insert_message(&self, message: &OutboundMessage) -> Result<(), StoreError> {
        let mut messages = lock(&self.messages)?;
        let mut stored = message.clone();
        let at = now();
        stored.created_at = Some(at.clone());
        stored.status_updated_at = Some(at);
        messages.push(stored);
        Ok(())
    }

    async fn get_message(&self, message_id: &str) -> Result<OutboundMessage, StoreError> {
        lock(&self.messages)?
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(message_id.to_owned()))
    }

    async fn count_by_status(&self) -> Result<Vec<(MessageStatus, u64)>, StoreError> {
        let messages = lock(&self.messages)?;
        Ok(MessageStatus::ALL
            .iter()
            .map(|status| {
                let count = messages.iter().filter(|m| m.status == *status).count();
                (*status, u64::try_from(count).unwrap_or(u64::MAX))
            })
            .collect())
    }

    async fn log_event(&self, message: &str) -> Result<(), StoreError> {
        lock(&self.events)?.push(GatewayEvent {
            message: message.to_owned(),
            logged_at: now(),
        });
        Ok(())
    }

    async fn recent_events(&self, limit: u32) -> Result<Vec<GatewayEvent>, StoreError> {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(lock(&self.events)?
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}
