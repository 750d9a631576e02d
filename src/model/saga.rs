//! Saga data types, §3 / §4.14.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::schedule::TaskSignature;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SagaStepState {
    Pending,
    Executing,
    Completed,
    Failed,
    Compensating,
    Compensated,
    CompensationFailed,
}

impl SagaStepState {
    /// Mirrors `TaskState::can_transition_from` for the smaller saga-step machine.
    pub fn can_transition_from(self, from: SagaStepState) -> bool {
        use SagaStepState::*;
        if from == self {
            return true;
        }
        matches!(
            (from, self),
            (Pending, Executing)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Completed, Compensating)
                | (Compensating, Compensated)
                | (Compensating, CompensationFailed)
        )
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SagaStep {
    pub execute: TaskSignature,
    /// Whether this step, once Completed, requires compensation if a later
    /// step fails (§4.14: "previously Completed, RequiresCompensation steps").
    pub requires_compensation: bool,
    pub compensate: Option<TaskSignature>,
    pub state: SagaStepState,
    pub result_task_id: Option<Uuid>,
    pub failure_reason: Option<String>,
}

impl SagaStep {
    pub fn new(execute: TaskSignature, compensate: Option<TaskSignature>) -> Self {
        Self {
            execute,
            requires_compensation: compensate.is_some(),
            compensate,
            state: SagaStepState::Pending,
            result_task_id: None,
            failure_reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SagaState {
    Pending,
    Executing,
    Completed,
    Compensating,
    Compensated,
    CompensationFailed,
    Failed,
    Cancelled,
}

impl SagaState {
    pub fn can_transition_from(self, from: SagaState) -> bool {
        use SagaState::*;
        if from == self {
            return true;
        }
        matches!(
            (from, self),
            (Pending, Executing)
                | (Executing, Completed)
                | (Executing, Compensating)
                | (Executing, Failed)
                | (Executing, Cancelled)
                | (Compensating, Compensated)
                | (Compensating, CompensationFailed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SagaState::Completed
                | SagaState::Compensated
                | SagaState::CompensationFailed
                | SagaState::Failed
                | SagaState::Cancelled
        )
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Saga {
    pub id: Uuid,
    pub steps: Vec<SagaStep>,
    pub current_step_index: usize,
    pub state: SagaState,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Saga {
    pub fn new(steps: Vec<SagaStep>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            steps,
            current_step_index: 0,
            state: SagaState::Pending,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}
