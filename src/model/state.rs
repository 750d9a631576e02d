//! The task state machine (§4.12 of the design spec).
//!
//! `TaskState` is a closed set with a fixed table of allowed edges. Every
//! write path in the crate (backend, executor) funnels through
//! [`TaskState::can_transition_from`] so the invariant "no illegal edge is ever
//! applied" holds regardless of which component performs the write.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle state of a single task execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum TaskState {
    Pending,
    Received,
    Started,
    Progress,
    Success,
    Failure,
    Retry,
    Revoked,
    Rejected,
    /// Reserved: no code path in this crate currently produces this state.
    /// A filter may explicitly request requeue-as-terminal in the future;
    /// until then, treat this as unreachable (see DESIGN.md open question).
    Requeued,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl TaskState {
    /// The set of states from which no further transition is ever allowed.
    pub const TERMINAL: [TaskState; 4] = [
        TaskState::Success,
        TaskState::Failure,
        TaskState::Revoked,
        TaskState::Rejected,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Allowed successor states for a transition starting from `self`.
    /// `from = None` models the "absent" starting point for a brand-new task_id.
    fn allowed_from(from: Option<TaskState>) -> &'static [TaskState] {
        use TaskState::*;
        match from {
            None => &[Pending, Received],
            Some(Pending) => &[Received, Revoked, Rejected],
            Some(Received) => &[Started, Revoked, Rejected, Retry],
            Some(Started) => &[Progress, Success, Failure, Retry, Revoked],
            Some(Progress) => &[Progress, Success, Failure, Revoked],
            Some(Retry) => &[Received, Revoked],
            Some(Requeued) => &[Received, Revoked],
            Some(Success) | Some(Failure) | Some(Revoked) | Some(Rejected) => &[],
        }
    }

    /// Whether `from -> self` is a legal edge: either a listed successor or
    /// an idempotent self-transition (always allowed, even from terminal states).
    pub fn can_transition_from(self, from: Option<TaskState>) -> bool {
        if from == Some(self) {
            return true;
        }
        Self::allowed_from(from).contains(&self)
    }
}
