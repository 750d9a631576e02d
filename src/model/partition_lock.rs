//! Partition lock data type, §3 / §4.4.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A per-key mutual-exclusion record. At any instant at most one
/// [`PartitionLock`] for a given `partition_key` may be unexpired.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PartitionLock {
    pub partition_key: String,
    pub holder_task_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl PartitionLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
