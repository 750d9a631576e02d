//! Revocation tombstone data type, §3.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Options controlling how a revocation should be enforced by a worker
/// that observes it.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct RevokeOptions {
    /// Cancel the handler's in-flight execution rather than letting it run to completion.
    pub terminate: bool,
    /// Propagate cancellation immediately via the handler's cancellation channel,
    /// rather than only being checked at the next lease.
    pub immediate: bool,
    /// Reserved for future signal-based cancellation (SIGTERM-equivalent); unused
    /// by the in-process executor, carried for wire compatibility.
    pub signal: Option<i32>,
}

/// A durable tombstone marking a task id as cancelled, with an optional
/// expiry after which `is_revoked` may again return false.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Revocation {
    pub task_id: Uuid,
    pub options: RevokeOptions,
    pub revoked_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Revocation {
    pub fn new(task_id: Uuid, options: RevokeOptions, ttl: Option<std::time::Duration>) -> Self {
        let revoked_at = Utc::now();
        let expires_at = ttl.and_then(|d| chrono::Duration::from_std(d).ok()).map(|d| revoked_at + d);
        Self {
            task_id,
            options,
            revoked_at,
            expires_at,
        }
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|e| e > now)
    }
}

/// An event published on the revocation subscribe stream (§4.5).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RevocationEvent {
    pub task_id: Uuid,
    pub options: RevokeOptions,
    pub revoked_at: DateTime<Utc>,
}

impl From<&Revocation> for RevocationEvent {
    fn from(r: &Revocation) -> Self {
        Self {
            task_id: r.task_id,
            options: r.options,
            revoked_at: r.revoked_at,
        }
    }
}
