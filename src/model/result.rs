//! `TaskResult` and exception payload, §3.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::state::TaskState;

/// Captured diagnostics for a failed task, analogous to a boxed exception.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExceptionInfo {
    pub exception_type: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ExceptionInfo {
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            exception_type: exception_type.into(),
            message: message.into(),
            stack: None,
        }
    }
}

/// Either a successful payload or captured exception info; never both.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Outcome {
    Result { bytes: Vec<u8>, content_type: String },
    Exception(ExceptionInfo),
}

/// The durable, terminal record of a task execution, written once the task
/// reaches a terminal [`TaskState`] and immutable thereafter (modulo TTL
/// expiry cleanup).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub state: TaskState,
    pub outcome: Option<Outcome>,
    pub completed_at: DateTime<Utc>,
    pub duration: std::time::Duration,
    pub retries: u32,
    pub worker: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TaskResult {
    pub fn success(
        task_id: Uuid,
        bytes: Vec<u8>,
        content_type: impl Into<String>,
        duration: std::time::Duration,
        retries: u32,
        worker: Option<String>,
    ) -> Self {
        Self {
            task_id,
            state: TaskState::Success,
            outcome: Some(Outcome::Result {
                bytes,
                content_type: content_type.into(),
            }),
            completed_at: Utc::now(),
            duration,
            retries,
            worker,
            expires_at: None,
        }
    }

    pub fn failure(
        task_id: Uuid,
        exception: ExceptionInfo,
        duration: std::time::Duration,
        retries: u32,
        worker: Option<String>,
    ) -> Self {
        Self {
            task_id,
            state: TaskState::Failure,
            outcome: Some(Outcome::Exception(exception)),
            completed_at: Utc::now(),
            duration,
            retries,
            worker,
            expires_at: None,
        }
    }

    pub fn terminal_without_payload(
        task_id: Uuid,
        state: TaskState,
        retries: u32,
        worker: Option<String>,
    ) -> Self {
        debug_assert!(state.is_terminal(), "terminal_without_payload requires a terminal state");
        Self {
            task_id,
            state,
            outcome: None,
            completed_at: Utc::now(),
            duration: std::time::Duration::ZERO,
            retries,
            worker,
            expires_at: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == TaskState::Success
    }
}
