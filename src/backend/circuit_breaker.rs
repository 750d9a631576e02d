//! Circuit-breaker-wrapped [`ResultBackend`] (§2.2 supplemented feature).
//!
//! Same shape as [`crate::broker::circuit_breaker::CircuitBreakerBroker`]:
//! delegates to an inner backend, tripping a [`CircuitBreaker`] on failure
//! so a flapping result store fails fast instead of stalling the worker
//! loop's state-publish calls.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::ResultBackend;
use crate::error::BackendError;
use crate::model::{TaskResult, TaskState};
use crate::resilience::{CircuitBreaker, CircuitBreakerBehavior, CircuitBreakerConfig};

#[derive(Debug)]
pub struct CircuitBreakerBackend {
    inner: std::sync::Arc<dyn ResultBackend>,
    breaker: CircuitBreaker,
}

impl CircuitBreakerBackend {
    pub fn new(inner: std::sync::Arc<dyn ResultBackend>, name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self { inner, breaker: CircuitBreaker::new(name, config) }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn guard<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        if !self.breaker.should_allow() {
            return Err(BackendError::CircuitBreakerOpen(self.breaker.name().to_string()));
        }
        let started = Instant::now();
        match call.await {
            Ok(value) => {
                self.breaker.record_success(started.elapsed());
                Ok(value)
            }
            Err(err) => {
                self.breaker.record_failure(started.elapsed());
                Err(err)
            }
        }
    }
}

#[async_trait]
impl ResultBackend for CircuitBreakerBackend {
    async fn store(&self, result: TaskResult) -> Result<(), BackendError> {
        self.guard(self.inner.store(result)).await
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<TaskResult>, BackendError> {
        self.guard(self.inner.get(task_id)).await
    }

    async fn update_state(&self, task_id: Uuid, state: TaskState, worker: Option<String>) -> Result<(), BackendError> {
        self.guard(self.inner.update_state(task_id, state, worker)).await
    }

    async fn get_state(&self, task_id: Uuid) -> Result<Option<TaskState>, BackendError> {
        self.guard(self.inner.get_state(task_id)).await
    }

    async fn wait_for_result(&self, task_id: Uuid, timeout: Duration) -> Result<TaskResult, BackendError> {
        self.guard(self.inner.wait_for_result(task_id, timeout)).await
    }

    async fn health_check(&self) -> Result<bool, BackendError> {
        if !self.breaker.is_healthy() {
            return Ok(false);
        }
        self.guard(self.inner.health_check()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::resilience::CircuitState;
    use std::sync::Arc;

    #[tokio::test]
    async fn breaker_opens_after_repeated_failures_and_fails_fast() {
        let inner = Arc::new(InMemoryBackend::new());
        let wrapped = CircuitBreakerBackend::new(
            inner,
            "backend",
            CircuitBreakerConfig { failure_threshold: 2, open_duration: Duration::from_secs(60), success_threshold: 1 },
        );

        // Illegal transition: Started has no existing Pending/Received row.
        let task_id = Uuid::now_v7();
        assert!(wrapped.update_state(task_id, TaskState::Started, None).await.is_err());
        assert!(wrapped.update_state(task_id, TaskState::Started, None).await.is_err());
        assert_eq!(wrapped.breaker().state(), CircuitState::Open);

        let err = wrapped.update_state(task_id, TaskState::Started, None).await.unwrap_err();
        assert!(matches!(err, BackendError::CircuitBreakerOpen(_)));
    }

    #[tokio::test]
    async fn healthy_calls_pass_through_untouched() {
        let inner = Arc::new(InMemoryBackend::new());
        let wrapped = CircuitBreakerBackend::new(inner, "backend", CircuitBreakerConfig::default());
        let task_id = Uuid::now_v7();
        wrapped.update_state(task_id, TaskState::Pending, None).await.unwrap();
        assert_eq!(wrapped.get_state(task_id).await.unwrap(), Some(TaskState::Pending));
    }
}
