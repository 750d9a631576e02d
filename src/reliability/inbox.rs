//! # Inbox (§4.6)
//!
//! Presence of a row for `message_id` means "already processed". A worker
//! checking `is_processed` before executing and `mark_processed` after the
//! side effect commits achieves effectively-once semantics when both
//! participate in the same transaction as the side effect.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::ReliabilityError;
use crate::model::InboxEntry;

#[async_trait]
pub trait InboxStore: Send + Sync + std::fmt::Debug {
    async fn is_processed(&self, message_id: Uuid) -> Result<bool, ReliabilityError>;

    async fn mark_processed(&self, message_id: Uuid) -> Result<(), ReliabilityError>;
}

/// An in-memory [`InboxStore`].
#[derive(Debug, Default)]
pub struct InMemoryInboxStore {
    entries: DashMap<Uuid, InboxEntry>,
}

impl InMemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InboxStore for InMemoryInboxStore {
    async fn is_processed(&self, message_id: Uuid) -> Result<bool, ReliabilityError> {
        Ok(self.entries.contains_key(&message_id))
    }

    async fn mark_processed(&self, message_id: Uuid) -> Result<(), ReliabilityError> {
        self.entries.insert(
            message_id,
            InboxEntry {
                message_id,
                processed_at: Utc::now(),
            },
        );
        Ok(())
    }
}
