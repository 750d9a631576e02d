//! # Result backend contract (§4.3)
//!
//! Stores the terminal (and in-flight) state of a task and lets callers
//! block on completion. `store` must be atomic and idempotent on `task_id`;
//! `update_state` must reject any edge [`TaskState::can_transition_from`]
//! forbids.

pub mod circuit_breaker;
pub mod in_memory;

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::error::BackendError;
use crate::model::{TaskResult, TaskState};

pub use circuit_breaker::CircuitBreakerBackend;
pub use in_memory::InMemoryBackend;

#[async_trait]
pub trait ResultBackend: Send + Sync + std::fmt::Debug {
    async fn store(&self, result: TaskResult) -> Result<(), BackendError>;

    async fn get(&self, task_id: Uuid) -> Result<Option<TaskResult>, BackendError>;

    /// Write a state for `task_id`. `from` must match the currently stored
    /// state (or be `None` for a brand-new task_id); rejected transitions
    /// never partially apply.
    async fn update_state(
        &self,
        task_id: Uuid,
        state: TaskState,
        worker: Option<String>,
    ) -> Result<(), BackendError>;

    async fn get_state(&self, task_id: Uuid) -> Result<Option<TaskState>, BackendError>;

    /// Returns immediately if a terminal result already exists; otherwise
    /// blocks until one is stored or `timeout` elapses.
    async fn wait_for_result(
        &self,
        task_id: Uuid,
        timeout: Duration,
    ) -> Result<TaskResult, BackendError>;

    async fn health_check(&self) -> Result<bool, BackendError>;
}
