//! # Worker executor (§4.12)
//!
//! Owns a pool of `concurrency` concurrent workers per process. Each worker
//! runs the twelve-step consume loop: lease, publish `Received`,
//! deserialize-or-reject, check revocation, check expiry, acquire the
//! partition lock, run pre-filters, run the handler under the time-limit
//! enforcer, run post/exception filters, map the outcome to a terminal
//! state, release the partition lock, and emit the terminal signal.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::backend::ResultBackend;
use crate::broker::Broker;
use crate::filters::{FilterPipeline, PreOutcome, Properties};
use crate::handler::{HandlerOutcome, TaskContext};
use crate::model::{ExceptionInfo, TaskMessage, TaskResult, TaskState};
use crate::registry::TaskRegistry;
use crate::signals::{SignalBus, TaskSignal};
use crate::stores::{PartitionLockStore, RevocationStore};
use crate::time_limit;

/// Exponential backoff with jitter for retried messages (§4.12 step 10, §6
/// `Worker configuration`).
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoff {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the computed delay to randomize, in `[0.0, 1.0]`.
    pub jitter: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl RetryBackoff {
    pub fn compute(&self, attempt: u32) -> Duration {
        let exp = self.base.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        let jitter_span = capped * self.jitter;
        let jittered = capped + fastrand::f64() * jitter_span - jitter_span / 2.0;
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub concurrency: usize,
    pub queues: Vec<String>,
    pub shutdown_grace: Duration,
    pub default_soft_time_limit: Option<Duration>,
    pub default_hard_time_limit: Option<Duration>,
    pub default_partition_lock_ttl: Duration,
    pub retry_backoff: RetryBackoff,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            queues: vec!["celery".to_string()],
            shutdown_grace: Duration::from_secs(30),
            default_soft_time_limit: None,
            default_hard_time_limit: None,
            default_partition_lock_ttl: Duration::from_secs(60),
            retry_backoff: RetryBackoff::default(),
        }
    }
}

/// Wires together a registry, broker, backend, and the supporting stores,
/// and runs the consume loop across `concurrency` worker tasks.
#[derive(Clone)]
pub struct WorkerExecutor {
    config: ExecutorConfig,
    broker: Arc<dyn Broker>,
    backend: Arc<dyn ResultBackend>,
    registry: Arc<TaskRegistry>,
    filters: Arc<FilterPipeline>,
    locks: Arc<dyn PartitionLockStore>,
    revocations: Arc<dyn RevocationStore>,
    signals: Arc<SignalBus>,
    worker_name: Arc<str>,
}

impl WorkerExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ExecutorConfig,
        broker: Arc<dyn Broker>,
        backend: Arc<dyn ResultBackend>,
        registry: Arc<TaskRegistry>,
        filters: Arc<FilterPipeline>,
        locks: Arc<dyn PartitionLockStore>,
        revocations: Arc<dyn RevocationStore>,
        signals: Arc<SignalBus>,
        worker_name: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            config,
            broker,
            backend,
            registry,
            filters,
            locks,
            revocations,
            signals,
            worker_name: worker_name.into(),
        }
    }

    /// Spawn `concurrency` worker loops. Each stops once `shutdown.cancelled()`
    /// fires, finishing its current delivery (bounded by `shutdown_grace`) first.
    pub fn spawn(self: &Arc<Self>, shutdown: tokio_util::sync::CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.config.concurrency)
            .map(|_| {
                let this = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { this.run_loop(shutdown).await })
            })
            .collect()
    }

    async fn run_loop(&self, shutdown: tokio_util::sync::CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            let deliveries = match self.broker.consume(&self.config.queues, 1).await {
                Ok(d) => d,
                Err(err) => {
                    tracing::warn!(%err, "broker consume failed");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
            };
            let Some(delivery) = deliveries.into_iter().next() else {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            };
            let span = tracing::info_span!("task", task_id = %delivery.message.id, task = %delivery.message.task);
            let _enter = span.enter();
            self.process_one(delivery.message, delivery.receipt, &shutdown).await;
        }
    }

    async fn process_one(
        &self,
        message: TaskMessage,
        receipt: crate::broker::ReceiptHandle,
        shutdown: &tokio_util::sync::CancellationToken,
    ) {
        let mut message = message;
        let queue = message.queue.clone();
        let task_id = message.id;
        let started_at = std::time::Instant::now();

        // Step 2: publish Received.
        if let Err(err) = self.backend.update_state(task_id, TaskState::Received, Some(self.worker_name.to_string())).await {
            tracing::warn!(%err, "failed to publish Received state");
        }

        // Step 3: resolve the handler; UnknownTask rejects with no requeue.
        let Some(descriptor) = self.registry.get(&message.task) else {
            let _ = self.backend.update_state(task_id, TaskState::Rejected, None).await;
            let _ = self.broker.nack(&queue, receipt, false, None).await;
            self.emit(task_id, TaskState::Rejected, message.correlation_id);
            return;
        };
        // A sender-supplied override wins; otherwise fall back to the
        // task's own registered default rather than the blanket default
        // `retry_or_fail` would otherwise apply.
        if message.max_retries.is_none() {
            message.max_retries = Some(descriptor.max_retries);
        }

        // Step 4: revocation check.
        match self.revocations.is_revoked(task_id).await {
            Ok(true) => {
                let _ = self.backend.update_state(task_id, TaskState::Revoked, None).await;
                let _ = self.broker.ack(&queue, receipt).await;
                self.emit(task_id, TaskState::Revoked, message.correlation_id);
                return;
            }
            Ok(false) => {}
            Err(err) => tracing::warn!(%err, "revocation check failed, proceeding"),
        }

        // Step 5: expiry check.
        if message.is_expired(Utc::now()) {
            let _ = self.backend.update_state(task_id, TaskState::Revoked, None).await;
            let _ = self.broker.ack(&queue, receipt).await;
            self.emit(task_id, TaskState::Revoked, message.correlation_id);
            return;
        }

        // Step 6: partition lock.
        let partition_key = descriptor
            .partition_key_selector
            .as_ref()
            .and_then(|selector| selector(&message.args));
        if let Some(key) = &partition_key {
            let ttl = descriptor.hard_time_limit.unwrap_or(self.config.default_partition_lock_ttl);
            match self.locks.try_acquire(key, task_id, ttl).await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    let delay = self.config.retry_backoff.compute(message.retries);
                    let _ = self.broker.nack(&queue, receipt, true, Some(delay)).await;
                    return;
                }
            }
        }

        // Step 7: pre-filters.
        let mut properties = Properties::new();
        let ctx = TaskContext {
            task_id,
            task_name: message.task.clone(),
            retries: message.retries,
            correlation_id: message.correlation_id,
            tenant_id: message.tenant_id.clone(),
            cancellation: shutdown.child_token(),
            soft_limit: tokio_util::sync::CancellationToken::new(),
        };

        let outcome = match self.filters.run_pre(&ctx, &mut properties).await {
            PreOutcome::Skip(outcome) => outcome,
            PreOutcome::Requeue { delay } => {
                self.release_lock(&partition_key, task_id).await;
                let _ = self.broker.nack(&queue, receipt, true, delay).await;
                return;
            }
            PreOutcome::Continue => {
                // Step 8: Started, then run the handler under the time-limit enforcer.
                let _ = self.backend.update_state(task_id, TaskState::Started, Some(self.worker_name.to_string())).await;
                let handler = descriptor.handler.clone();
                let args = message.args.clone();
                let soft = descriptor.soft_time_limit.or(self.config.default_soft_time_limit);
                let hard = descriptor.hard_time_limit.or(self.config.default_hard_time_limit);
                let watcher = self.spawn_immediate_revocation_watcher(task_id, ctx.cancellation.clone());
                let handler_outcome = time_limit::enforce(&ctx, soft, hard, async { handler.call(&ctx, &args).await }).await;
                watcher.abort();
                // Step 9: post/exception filters.
                self.filters.run_post(&ctx, &mut properties, handler_outcome).await
            }
        };

        // Step 10: map outcome to terminal state (or requeue for Retry).
        let duration = started_at.elapsed();
        let terminal = self
            .apply_outcome(&queue, receipt, task_id, &message, outcome, duration)
            .await;

        // Step 11: release the partition lock on every exit path.
        self.release_lock(&partition_key, task_id).await;

        // Step 12: emit the terminal signal, if one was reached.
        if let Some(state) = terminal {
            self.emit(task_id, state, message.correlation_id);
        }
    }

    async fn release_lock(&self, partition_key: &Option<String>, task_id: Uuid) {
        if let Some(key) = partition_key {
            let _ = self.locks.release(key, task_id).await;
        }
    }

    /// Watches the revocation stream while the handler runs, cancelling
    /// `cancellation` the moment a `terminate && immediate` revocation for
    /// `task_id` is observed, rather than waiting for the next lease to
    /// notice it (§4.5 "propagate cancellation immediately"). Aborted by
    /// the caller once the handler returns.
    fn spawn_immediate_revocation_watcher(
        &self,
        task_id: Uuid,
        cancellation: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let mut events = self.revocations.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if event.task_id == task_id && event.options.terminate && event.options.immediate {
                    cancellation.cancel();
                    break;
                }
            }
        })
    }

    /// Returns the terminal state reached, or `None` if the message was
    /// requeued without reaching one (a `Retry` that didn't exhaust attempts).
    async fn apply_outcome(
        &self,
        queue: &str,
        receipt: crate::broker::ReceiptHandle,
        task_id: Uuid,
        message: &TaskMessage,
        outcome: HandlerOutcome,
        duration: Duration,
    ) -> Option<TaskState> {
        let worker = Some(self.worker_name.to_string());
        match outcome {
            HandlerOutcome::Success { bytes, content_type } => {
                let result = TaskResult::success(task_id, bytes, content_type, duration, message.retries, worker);
                let _ = self.backend.store(result).await;
                let _ = self.broker.ack(queue, receipt).await;
                Some(TaskState::Success)
            }
            HandlerOutcome::Retry { reason, countdown } => {
                self.retry_or_fail(queue, receipt, task_id, message, reason, countdown, duration, worker).await
            }
            HandlerOutcome::Reject { reason, requeue } => {
                tracing::info!(%reason, "task rejected");
                let _ = self.backend.update_state(task_id, TaskState::Rejected, worker).await;
                let _ = self.broker.nack(queue, receipt, requeue, None).await;
                Some(TaskState::Rejected)
            }
            HandlerOutcome::Cancelled => {
                let _ = self.backend.update_state(task_id, TaskState::Revoked, worker).await;
                let _ = self.broker.ack(queue, receipt).await;
                Some(TaskState::Revoked)
            }
            HandlerOutcome::TimedOut => {
                let exception = ExceptionInfo::new("TimeoutError", "hard time limit exceeded");
                let result = TaskResult::failure(task_id, exception, duration, message.retries, worker);
                let _ = self.backend.store(result).await;
                let _ = self.broker.ack(queue, receipt).await;
                Some(TaskState::Failure)
            }
            HandlerOutcome::SoftTimeLimitExceeded => {
                let exception = ExceptionInfo::new("SoftTimeLimitExceeded", "soft time limit exceeded");
                let result = TaskResult::failure(task_id, exception, duration, message.retries, worker);
                let _ = self.backend.store(result).await;
                let _ = self.broker.ack(queue, receipt).await;
                Some(TaskState::Failure)
            }
            HandlerOutcome::Failure { exception_type, message: msg, stack } => {
                let mut exception = ExceptionInfo::new(exception_type, msg);
                exception.stack = stack;
                let result = TaskResult::failure(task_id, exception, duration, message.retries, worker);
                let _ = self.backend.store(result).await;
                let _ = self.broker.ack(queue, receipt).await;
                Some(TaskState::Failure)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn retry_or_fail(
        &self,
        queue: &str,
        receipt: crate::broker::ReceiptHandle,
        task_id: Uuid,
        message: &TaskMessage,
        reason: String,
        countdown: Option<Duration>,
        duration: Duration,
        worker: Option<String>,
    ) -> Option<TaskState> {
        let max_retries = message.max_retries.unwrap_or(3);
        if message.retries >= max_retries {
            let exception = ExceptionInfo::new("MaxRetriesExceeded", reason);
            let result = TaskResult::failure(task_id, exception, duration, message.retries, worker);
            let _ = self.backend.store(result).await;
            let _ = self.broker.ack(queue, receipt).await;
            return Some(TaskState::Failure);
        }
        let _ = self.backend.update_state(task_id, TaskState::Retry, worker).await;
        let delay = countdown.unwrap_or_else(|| self.config.retry_backoff.compute(message.retries));
        let retried = message.for_retry(None);
        // End the current lease, then republish after the backoff delay so
        // the retried attempt doesn't immediately contend with other workers.
        let _ = self.broker.ack(queue, receipt).await;
        let broker = self.broker.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(err) = broker.publish(retried).await {
                tracing::warn!(%err, "failed to republish retried task");
            }
        });
        None
    }

    fn emit(&self, task_id: Uuid, state: TaskState, correlation_id: Option<Uuid>) {
        self.signals.publish(TaskSignal { task_id, state, correlation_id });
    }
}
