//! In-memory reference [`ResultBackend`].

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

use super::ResultBackend;
use crate::error::{BackendError, InvalidTransition};
use crate::model::{TaskResult, TaskState};

#[derive(Debug, Clone)]
struct Slot {
    state: TaskState,
    result: Option<TaskResult>,
}

/// An in-memory [`ResultBackend`]. Results live for the lifetime of the process.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    slots: DashMap<Uuid, Slot>,
    notify: DashMap<Uuid, Arc<Notify>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify_for(&self, task_id: Uuid) -> Arc<Notify> {
        self.notify
            .entry(task_id)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn apply_transition(&self, task_id: Uuid, state: TaskState) -> Result<(), BackendError> {
        let current = self.slots.get(&task_id).map(|s| s.state);
        if !state.can_transition_from(current) {
            return Err(InvalidTransition {
                task_id,
                from: current,
                to: state,
            }
            .into());
        }
        Ok(())
    }
}

#[async_trait]
impl ResultBackend for InMemoryBackend {
    async fn store(&self, result: TaskResult) -> Result<(), BackendError> {
        self.apply_transition(result.task_id, result.state)?;
        let task_id = result.task_id;
        let state = result.state;
        self.slots.insert(task_id, Slot { state, result: Some(result) });
        self.notify_for(task_id).notify_waiters();
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<TaskResult>, BackendError> {
        Ok(self.slots.get(&task_id).and_then(|s| s.result.clone()))
    }

    async fn update_state(
        &self,
        task_id: Uuid,
        state: TaskState,
        worker: Option<String>,
    ) -> Result<(), BackendError> {
        self.apply_transition(task_id, state)?;
        let previous_result = self.slots.get(&task_id).and_then(|s| s.result.clone());
        let result = if state.is_terminal() {
            previous_result.or_else(|| {
                Some(TaskResult::terminal_without_payload(task_id, state, 0, worker))
            })
        } else {
            previous_result
        };
        self.slots.insert(task_id, Slot { state, result });
        self.notify_for(task_id).notify_waiters();
        Ok(())
    }

    async fn get_state(&self, task_id: Uuid) -> Result<Option<TaskState>, BackendError> {
        Ok(self.slots.get(&task_id).map(|s| s.state))
    }

    async fn wait_for_result(
        &self,
        task_id: Uuid,
        timeout: Duration,
    ) -> Result<TaskResult, BackendError> {
        let notify = self.notify_for(task_id);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register as a waiter before re-checking the slot, so a
            // `store`/`update_state` that lands between the check below and
            // this call can't notify an empty waiter list and get missed.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(slot) = self.slots.get(&task_id) {
                if slot.state.is_terminal() {
                    if let Some(result) = slot.result.clone() {
                        return Ok(result);
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(BackendError::WaitTimeout(task_id));
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Err(BackendError::WaitTimeout(task_id));
            }
        }
    }

    async fn health_check(&self) -> Result<bool, BackendError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_then_get_round_trips() {
        let backend = InMemoryBackend::new();
        let task_id = Uuid::now_v7();
        backend
            .update_state(task_id, TaskState::Pending, None)
            .await
            .unwrap();
        backend
            .update_state(task_id, TaskState::Received, None)
            .await
            .unwrap();
        let result = TaskResult::success(task_id, b"ok".to_vec(), "application/json", Duration::from_millis(1), 0, None);
        backend.store(result).await.unwrap();
        let fetched = backend.get(task_id).await.unwrap().unwrap();
        assert!(fetched.is_success());
    }

    #[tokio::test]
    async fn update_state_rejects_illegal_transition() {
        let backend = InMemoryBackend::new();
        let task_id = Uuid::now_v7();
        backend
            .update_state(task_id, TaskState::Success, None)
            .await
            .unwrap();
        let err = backend
            .update_state(task_id, TaskState::Started, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn wait_for_result_returns_immediately_if_already_terminal() {
        let backend = InMemoryBackend::new();
        let task_id = Uuid::now_v7();
        let result = TaskResult::success(task_id, vec![], "application/json", Duration::ZERO, 0, None);
        backend.store(result).await.unwrap();
        let fetched = backend
            .wait_for_result(task_id, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(fetched.is_success());
    }

    #[tokio::test]
    async fn wait_for_result_unblocks_once_stored() {
        let backend = Arc::new(InMemoryBackend::new());
        let task_id = Uuid::now_v7();
        let waiter = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.wait_for_result(task_id, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = TaskResult::success(task_id, vec![], "application/json", Duration::ZERO, 0, None);
        backend.store(result).await.unwrap();
        let fetched = waiter.await.unwrap().unwrap();
        assert!(fetched.is_success());
    }

    #[tokio::test]
    async fn wait_for_result_times_out_when_nothing_arrives() {
        let backend = InMemoryBackend::new();
        let task_id = Uuid::now_v7();
        let err = backend
            .wait_for_result(task_id, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::WaitTimeout(_)));
    }
}
