//! The task envelope ("TaskMessage"), §3.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// An immutable-once-published envelope carrying a task invocation from the
/// client, through the (outbox →) broker, to a worker.
///
/// Only the retry counter and headers are rewritten when a message is
/// republished (on retry); every other field is fixed at creation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskMessage {
    pub id: Uuid,
    pub task: String,
    pub queue: String,
    /// Serialized input, opaque to everything except the registered handler.
    pub args: Vec<u8>,
    pub content_type: String,
    pub timestamp: DateTime<Utc>,
    pub eta: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    /// 0 (lowest) .. 9 (highest).
    pub priority: u8,
    pub retries: u32,
    pub max_retries: Option<u32>,
    pub correlation_id: Option<Uuid>,
    pub partition_key: Option<String>,
    pub tenant_id: Option<String>,
    pub headers: HashMap<String, String>,
}

impl TaskMessage {
    pub fn new(task: impl Into<String>, queue: impl Into<String>, args: Vec<u8>) -> Self {
        Self {
            id: Uuid::now_v7(),
            task: task.into(),
            queue: queue.into(),
            args,
            content_type: "application/json".to_string(),
            timestamp: Utc::now(),
            eta: None,
            expires: None,
            priority: 5,
            retries: 0,
            max_retries: None,
            correlation_id: None,
            partition_key: None,
            tenant_id: None,
            headers: HashMap::new(),
        }
    }

    /// Whether this message's `expires` deadline has already passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|e| e < now)
    }

    /// Produce a republished copy with `retries` incremented and a headers
    /// patch applied. Every other field, including `id`, is preserved so the
    /// result backend keeps tracking the same logical task.
    pub fn for_retry(&self, extra_headers: Option<HashMap<String, String>>) -> Self {
        let mut msg = self.clone();
        msg.retries += 1;
        if let Some(extra) = extra_headers {
            msg.headers.extend(extra);
        }
        msg
    }
}
