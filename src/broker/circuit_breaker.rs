//! Circuit-breaker-wrapped [`Broker`] (§2.2 supplemented feature).
//!
//! Delegates every call to an inner broker, tripping a [`CircuitBreaker`]
//! on failure so a flapping transport doesn't let the worker loop spin into
//! an unbounded retry storm. When the breaker is open, calls fail fast with
//! [`BrokerError::CircuitBreakerOpen`] instead of reaching the inner broker.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Broker, Delivery, QueueOptions, QueueStats, ReceiptHandle};
use crate::error::BrokerError;
use crate::model::TaskMessage;
use crate::resilience::{CircuitBreaker, CircuitBreakerBehavior, CircuitBreakerConfig};

#[derive(Debug)]
pub struct CircuitBreakerBroker {
    inner: Arc<dyn Broker>,
    breaker: CircuitBreaker,
}

impl CircuitBreakerBroker {
    pub fn new(inner: Arc<dyn Broker>, name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self { inner, breaker: CircuitBreaker::new(name, config) }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn guard<T>(
        &self,
        call: impl std::future::Future<Output = Result<T, BrokerError>>,
    ) -> Result<T, BrokerError> {
        if !self.breaker.should_allow() {
            return Err(BrokerError::CircuitBreakerOpen(self.breaker.name().to_string()));
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
impl Broker for CircuitBreakerBroker {
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.guard(self.inner.declare_queue(queue, options)).await
    }

    async fn publish(&self, message: TaskMessage) -> Result<(), BrokerError> {
        self.guard(self.inner.publish(message)).await
    }

    async fn consume(&self, queues: &[String], max: usize) -> Result<Vec<Delivery>, BrokerError> {
        self.guard(self.inner.consume(queues, max)).await
    }

    async fn ack(&self, queue: &str, receipt: ReceiptHandle) -> Result<(), BrokerError> {
        self.guard(self.inner.ack(queue, receipt)).await
    }

    async fn nack(
        &self,
        queue: &str,
        receipt: ReceiptHandle,
        requeue: bool,
        delay: Option<Duration>,
    ) -> Result<(), BrokerError> {
        self.guard(self.inner.nack(queue, receipt, requeue, delay)).await
    }

    async fn queue_length(&self, queue: &str) -> Result<usize, BrokerError> {
        self.guard(self.inner.queue_length(queue)).await
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, BrokerError> {
        self.guard(self.inner.queue_stats(queue)).await
    }

    async fn health_check(&self) -> Result<bool, BrokerError> {
        if !self.breaker.is_healthy() {
            return Ok(false);
        }
        self.guard(self.inner.health_check()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::resilience::CircuitState;

    #[tokio::test]
    async fn breaker_opens_after_repeated_failures_and_fails_fast() {
        let inner = Arc::new(InMemoryBroker::new());
        inner.declare_queue("celery", QueueOptions::default()).await.unwrap();
        let wrapped = CircuitBreakerBroker::new(
            inner,
            "broker",
            CircuitBreakerConfig { failure_threshold: 2, open_duration: Duration::from_secs(60), success_threshold: 1 },
        );

        // An unrecognized receipt handle fails every time (already acked / never issued).
        let bogus = ReceiptHandle(999_999);
        assert!(wrapped.ack("celery", bogus).await.is_err());
        assert!(wrapped.ack("celery", bogus).await.is_err());
        assert_eq!(wrapped.breaker().state(), CircuitState::Open);

        let err = wrapped.ack("celery", bogus).await.unwrap_err();
        assert!(matches!(err, BrokerError::CircuitBreakerOpen(_)));
    }

    #[tokio::test]
    async fn healthy_calls_pass_through_untouched() {
        let inner = Arc::new(InMemoryBroker::new());
        let wrapped = CircuitBreakerBroker::new(inner, "broker", CircuitBreakerConfig::default());
        wrapped.declare_queue("celery", QueueOptions::default()).await.unwrap();
        wrapped.publish(TaskMessage::new("t", "celery", vec![])).await.unwrap();
        assert_eq!(wrapped.queue_length("celery").await.unwrap(), 1);
    }
}
