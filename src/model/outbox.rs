//! Outbox/inbox data types, §3 / §4.6.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::message::TaskMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Dispatched,
    Failed,
}

/// An outbox row. `append` happens inside the caller's own durable
/// transaction; `sequence_number` fixes total order across the destination.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub task_message: TaskMessage,
    pub status: OutboxStatus,
    pub sequence_number: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxEntry {
    pub fn new(task_message: TaskMessage, sequence_number: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            task_message,
            status: OutboxStatus::Pending,
            sequence_number,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An inbox row. Presence of a row for `message_id` means "already processed".
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InboxEntry {
    pub message_id: Uuid,
    pub processed_at: DateTime<Utc>,
}
