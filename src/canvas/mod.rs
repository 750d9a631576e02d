//! # Canvas: chain, group, chord (§4.14)
//!
//! Composes plain [`TaskSignature`]s into workflows by submitting them
//! through a [`Broker`]/[`ResultBackend`] pair and waiting on each step's
//! terminal result before deciding what to submit next. None of this
//! needs the full [`crate::client::Client`] — only the two contracts a
//! composition actually touches.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::backend::ResultBackend;
use crate::broker::Broker;
use crate::error::CanvasError;
use crate::model::{Batch, BatchState, Outcome, TaskMessage, TaskResult, TaskSignature, TaskState};

/// Submits [`TaskSignature`]s and waits on their terminal [`TaskResult`],
/// the primitive both [`Chain`]/[`Group`]/[`Chord`] and the saga
/// orchestrator are built from.
#[derive(Clone)]
pub struct TaskSubmitter {
    pub broker: Arc<dyn Broker>,
    pub backend: Arc<dyn ResultBackend>,
    pub default_queue: String,
    pub step_timeout: Duration,
}

impl TaskSubmitter {
    pub fn new(broker: Arc<dyn Broker>, backend: Arc<dyn ResultBackend>, default_queue: impl Into<String>, step_timeout: Duration) -> Self {
        Self { broker, backend, default_queue: default_queue.into(), step_timeout }
    }

    pub async fn submit(&self, signature: &TaskSignature) -> Result<Uuid, CanvasError> {
        let mut message = TaskMessage::new(signature.task.clone(), self.default_queue.clone(), signature.args.clone());
        message.content_type = signature.content_type.clone();
        let task_id = message.id;
        self.backend
            .update_state(task_id, TaskState::Pending, None)
            .await
            .map_err(|e| CanvasError::Client(Box::new(e.into())))?;
        self.broker
            .publish(message)
            .await
            .map_err(|e| CanvasError::Client(Box::new(e.into())))?;
        Ok(task_id)
    }

    pub async fn await_result(&self, task_id: Uuid) -> Result<TaskResult, CanvasError> {
        self.backend
            .wait_for_result(task_id, self.step_timeout)
            .await
            .map_err(|e| CanvasError::Client(Box::new(e.into())))
    }
}

/// An ordered list of signatures. Each step's predecessor's success bytes
/// are prepended to the step's own `args` before submission — the chain's
/// "binary-concatenated into the next input" contract.
#[derive(Debug, Clone)]
pub struct Chain {
    pub steps: Vec<TaskSignature>,
}

impl Chain {
    pub fn new(steps: Vec<TaskSignature>) -> Self {
        Self { steps }
    }

    /// Runs every step in order, stopping at (and returning) the first
    /// non-success terminal result.
    pub async fn run(&self, submitter: &TaskSubmitter) -> Result<TaskResult, CanvasError> {
        if self.steps.is_empty() {
            return Err(CanvasError::EmptyChain);
        }
        let mut carry: Option<Vec<u8>> = None;
        let mut last = None;
        for step in &self.steps {
            let mut signature = step.clone();
            if let Some(prev_bytes) = &carry {
                let mut combined = prev_bytes.clone();
                combined.extend_from_slice(&step.args);
                signature.args = combined;
            }
            let task_id = submitter.submit(&signature).await?;
            let result = submitter.await_result(task_id).await?;
            if !result.is_success() {
                return Ok(result);
            }
            carry = match &result.outcome {
                Some(Outcome::Result { bytes, .. }) => Some(bytes.clone()),
                _ => None,
            };
            last = Some(result);
        }
        // Non-empty steps guarantees at least one iteration ran.
        Ok(last.expect("chain with at least one step always produces a result"))
    }
}

/// A fan-out of independent signatures. Completes once every child has
/// reached a terminal state, tracked via [`Batch`].
#[derive(Debug, Clone)]
pub struct Group {
    pub children: Vec<TaskSignature>,
}

impl Group {
    pub fn new(children: Vec<TaskSignature>) -> Self {
        Self { children }
    }

    pub async fn run(&self, submitter: &TaskSubmitter) -> Result<Batch, CanvasError> {
        if self.children.is_empty() {
            return Err(CanvasError::EmptyGroup);
        }
        let mut task_ids = Vec::with_capacity(self.children.len());
        for child in &self.children {
            task_ids.push(submitter.submit(child).await?);
        }

        let results = futures::future::join_all(task_ids.iter().map(|id| submitter.await_result(*id))).await;

        let mut batch = Batch::new(task_ids.clone());
        for (task_id, result) in task_ids.iter().zip(results) {
            let result = result?;
            batch.record(*task_id, result.state);
        }
        Ok(batch)
    }
}

/// A [`Group`] followed by a callback signature, submitted only once every
/// child in the group has succeeded.
#[derive(Debug, Clone)]
pub struct Chord {
    pub group: Group,
    pub callback: TaskSignature,
}

impl Chord {
    pub fn new(group: Group, callback: TaskSignature) -> Self {
        Self { group, callback }
    }

    /// Returns `Ok(None)` if any child failed — the callback is never
    /// submitted — otherwise the callback's own terminal result.
    pub async fn run(&self, submitter: &TaskSubmitter) -> Result<Option<TaskResult>, CanvasError> {
        let batch = self.group.run(submitter).await?;
        if batch.state() != BatchState::Complete {
            return Ok(None);
        }
        let task_id = submitter.submit(&self.callback).await?;
        Ok(Some(submitter.await_result(task_id).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::broker::{InMemoryBroker, QueueOptions};
    use crate::model::{ExceptionInfo, TaskState};

    fn sig(task: &str, args: &[u8]) -> TaskSignature {
        TaskSignature {
            task: task.to_string(),
            args: args.to_vec(),
            content_type: "application/json".to_string(),
        }
    }

    async fn harness() -> (TaskSubmitter, Arc<InMemoryBroker>, Arc<InMemoryBackend>) {
        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_queue("celery", QueueOptions::default()).await.unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let submitter = TaskSubmitter::new(broker.clone(), backend.clone(), "celery", Duration::from_secs(2));
        (submitter, broker, backend)
    }

    /// Drains one delivery per queued message and resolves it to `state`,
    /// simulating a worker without running the full executor.
    async fn resolve_all(broker: &InMemoryBroker, backend: &InMemoryBackend, outcome_bytes: &[u8]) {
        loop {
            let deliveries = broker.consume(&["celery".to_string()], 16).await.unwrap();
            if deliveries.is_empty() {
                break;
            }
            for delivery in deliveries {
                backend.update_state(delivery.message.id, TaskState::Received, None).await.unwrap();
                backend.update_state(delivery.message.id, TaskState::Started, None).await.unwrap();
                let result = TaskResult::success(delivery.message.id, outcome_bytes.to_vec(), "application/json", Duration::from_millis(1), 0, None);
                backend.store(result).await.unwrap();
                broker.ack("celery", delivery.receipt).await.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn chain_runs_to_completion_when_every_step_succeeds() {
        let (submitter, broker, backend) = harness().await;
        let chain = Chain::new(vec![sig("step1", b"a"), sig("step2", b"b")]);

        let run = tokio::spawn({
            let submitter = submitter.clone();
            async move { chain.run(&submitter).await }
        });
        // Resolve step1, then step2, as they appear.
        tokio::time::sleep(Duration::from_millis(10)).await;
        resolve_all(&broker, &backend, b"r1").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        resolve_all(&broker, &backend, b"r2").await;

        let result = run.await.unwrap().unwrap();
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn chain_stops_at_first_failure() {
        let (submitter, broker, backend) = harness().await;
        let chain = Chain::new(vec![sig("step1", b"a"), sig("step2", b"b")]);

        let run = tokio::spawn({
            let submitter = submitter.clone();
            async move { chain.run(&submitter).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let deliveries = broker.consume(&["celery".to_string()], 16).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        let delivery = &deliveries[0];
        let result = TaskResult::failure(
            delivery.message.id,
            ExceptionInfo::new("BoomError", "step1 exploded"),
            Duration::from_millis(1),
            0,
            None,
        );
        backend.store(result).await.unwrap();
        broker.ack("celery", delivery.receipt).await.unwrap();

        let result = run.await.unwrap().unwrap();
        assert_eq!(result.state, TaskState::Failure);
        // Step2 was never submitted.
        assert_eq!(broker.queue_length("celery").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn group_completes_once_every_child_is_terminal() {
        let (submitter, broker, backend) = harness().await;
        let group = Group::new(vec![sig("a", b""), sig("b", b""), sig("c", b"")]);

        let run = tokio::spawn({
            let submitter = submitter.clone();
            async move { group.run(&submitter).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        resolve_all(&broker, &backend, b"ok").await;

        let batch = run.await.unwrap().unwrap();
        assert_eq!(batch.state(), BatchState::Complete);
    }

    #[tokio::test]
    async fn chord_callback_only_fires_when_the_whole_group_succeeds() {
        let (submitter, broker, backend) = harness().await;
        let chord = Chord::new(Group::new(vec![sig("a", b""), sig("b", b"")]), sig("callback", b""));

        let run = tokio::spawn({
            let submitter = submitter.clone();
            async move { chord.run(&submitter).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Fail one child.
        let deliveries = broker.consume(&["celery".to_string()], 16).await.unwrap();
        for (i, delivery) in deliveries.into_iter().enumerate() {
            if i == 0 {
                let result = TaskResult::failure(
                    delivery.message.id,
                    ExceptionInfo::new("BoomError", "nope"),
                    Duration::from_millis(1),
                    0,
                    None,
                );
                backend.store(result).await.unwrap();
            } else {
                let result = TaskResult::success(delivery.message.id, b"ok".to_vec(), "application/json", Duration::from_millis(1), 0, None);
                backend.store(result).await.unwrap();
            }
            broker.ack("celery", delivery.receipt).await.unwrap();
        }

        let callback_result = run.await.unwrap().unwrap();
        assert!(callback_result.is_none());
        assert_eq!(broker.queue_length("celery").await.unwrap(), 0);
    }
}
