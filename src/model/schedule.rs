//! Beat scheduler entry data type, §3 / §4.13.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The task name + serialized args a schedule entry fires on each tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSignature {
    pub task: String,
    pub args: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScheduleKind {
    Cron(String),
    Interval(std::time::Duration),
}

/// Per-entry overrides applied to the message a schedule entry produces.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleOptions {
    pub queue: Option<String>,
    pub priority: Option<u8>,
    pub expires_in: Option<std::time::Duration>,
}

/// A single beat entry, keyed by `name`, persisted across restarts when
/// `PersistState` is enabled (§4.13).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub name: String,
    pub kind: ScheduleKind,
    pub signature: TaskSignature,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    pub options: ScheduleOptions,
}

impl ScheduleEntry {
    pub fn should_run(&self, now: DateTime<Utc>) -> bool {
        self.next_run <= now
    }
}
