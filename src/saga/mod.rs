//! # Saga orchestrator (§4.14)
//!
//! Drives a [`Saga`]'s steps in order, exactly like [`crate::canvas::Chain`]
//! but with compensation: the first step whose execution fails moves the
//! saga to `Compensating`, and every previously `Completed`,
//! `requires_compensation` step has its `compensate` signature run, in
//! reverse order.
//!
//! Open question resolved here: whether a saga stuck in `Compensating` (a
//! failed compensation) may be retried back into `Executing` is left
//! unspecified upstream. We decided **no** — [`SagaState::can_transition_from`]
//! has no `Compensating -> Executing` edge, so a stuck saga must be
//! abandoned and resubmitted as a new one; there is no in-place retry path.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::ResultBackend;
use crate::broker::Broker;
use crate::canvas::TaskSubmitter;
use crate::error::CanvasError;
use crate::model::{Saga, SagaState, SagaStepState};

#[derive(Clone)]
pub struct SagaOrchestrator {
    submitter: TaskSubmitter,
}

impl SagaOrchestrator {
    pub fn new(broker: Arc<dyn Broker>, backend: Arc<dyn ResultBackend>, default_queue: impl Into<String>, step_timeout: Duration) -> Self {
        Self { submitter: TaskSubmitter::new(broker, backend, default_queue, step_timeout) }
    }

    fn transition_saga(saga: &mut Saga, to: SagaState) -> Result<(), CanvasError> {
        if !to.can_transition_from(saga.state) {
            return Err(CanvasError::InvalidSagaState {
                saga_id: saga.id,
                from: format!("{:?}", saga.state),
                to: format!("{:?}", to),
            });
        }
        saga.state = to;
        saga.updated_at = chrono::Utc::now();
        Ok(())
    }

    fn transition_step(saga: &mut Saga, index: usize, to: SagaStepState) -> Result<(), CanvasError> {
        let from = saga.steps[index].state;
        if !to.can_transition_from(from) {
            return Err(CanvasError::InvalidSagaTransition {
                saga_id: saga.id,
                index,
                from: format!("{from:?}"),
                to: format!("{to:?}"),
            });
        }
        saga.steps[index].state = to;
        Ok(())
    }

    /// Runs `saga` to a terminal [`SagaState`]: `Completed` if every step
    /// succeeds, or `Compensated`/`CompensationFailed` once compensation
    /// finishes after the first failed step.
    pub async fn run(&self, mut saga: Saga) -> Result<Saga, CanvasError> {
        if saga.steps.is_empty() {
            return Err(CanvasError::EmptySaga(saga.id));
        }
        Self::transition_saga(&mut saga, SagaState::Executing)?;

        for index in 0..saga.steps.len() {
            saga.current_step_index = index;
            Self::transition_step(&mut saga, index, SagaStepState::Executing)?;

            let signature = saga.steps[index].execute.clone();
            let task_id = self.submitter.submit(&signature).await?;
            let result = self.submitter.await_result(task_id).await?;
            saga.steps[index].result_task_id = Some(task_id);

            if result.is_success() {
                Self::transition_step(&mut saga, index, SagaStepState::Completed)?;
                continue;
            }

            let reason = match &result.outcome {
                Some(crate::model::Outcome::Exception(exception)) => exception.message.clone(),
                _ => format!("step finished in state {:?}", result.state),
            };
            saga.steps[index].failure_reason = Some(reason.clone());
            Self::transition_step(&mut saga, index, SagaStepState::Failed)?;
            saga.failure_reason = Some(reason);
            return self.compensate(saga, index).await;
        }

        Self::transition_saga(&mut saga, SagaState::Completed)?;
        Ok(saga)
    }

    /// Executes compensations for every previously `Completed`,
    /// `requires_compensation` step before `failed_index`, in reverse order.
    async fn compensate(&self, mut saga: Saga, failed_index: usize) -> Result<Saga, CanvasError> {
        Self::transition_saga(&mut saga, SagaState::Compensating)?;

        let mut any_compensation_failed = false;
        for index in (0..failed_index).rev() {
            if saga.steps[index].state != SagaStepState::Completed || !saga.steps[index].requires_compensation {
                continue;
            }
            let Some(compensate_signature) = saga.steps[index].compensate.clone() else {
                continue;
            };

            Self::transition_step(&mut saga, index, SagaStepState::Compensating)?;
            let compensated = match self.submitter.submit(&compensate_signature).await {
                Ok(task_id) => self.submitter.await_result(task_id).await.map(|r| r.is_success()),
                Err(err) => Err(err),
            };

            match compensated {
                Ok(true) => Self::transition_step(&mut saga, index, SagaStepState::Compensated)?,
                Ok(false) | Err(_) => {
                    Self::transition_step(&mut saga, index, SagaStepState::CompensationFailed)?;
                    any_compensation_failed = true;
                }
            }
        }

        let terminal = if any_compensation_failed { SagaState::CompensationFailed } else { SagaState::Compensated };
        Self::transition_saga(&mut saga, terminal)?;
        Ok(saga)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::broker::{InMemoryBroker, QueueOptions};
    use crate::model::{ExceptionInfo, SagaStep, TaskResult, TaskSignature};

    fn sig(task: &str) -> TaskSignature {
        TaskSignature { task: task.to_string(), args: Vec::new(), content_type: "application/json".to_string() }
    }

    async fn harness() -> (SagaOrchestrator, Arc<InMemoryBroker>, Arc<InMemoryBackend>) {
        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_queue("celery", QueueOptions::default()).await.unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let orchestrator = SagaOrchestrator::new(broker.clone(), backend.clone(), "celery", Duration::from_secs(2));
        (orchestrator, broker, backend)
    }

    async fn resolve_next(broker: &InMemoryBroker, backend: &InMemoryBackend, succeed: bool) {
        let delivery = broker.consume(&["celery".to_string()], 1).await.unwrap().remove(0);
        let result = if succeed {
            TaskResult::success(delivery.message.id, b"ok".to_vec(), "application/json", Duration::from_millis(1), 0, None)
        } else {
            TaskResult::failure(delivery.message.id, ExceptionInfo::new("BoomError", "nope"), Duration::from_millis(1), 0, None)
        };
        backend.store(result).await.unwrap();
        broker.ack("celery", delivery.receipt).await.unwrap();
    }

    #[tokio::test]
    async fn every_step_succeeding_completes_the_saga() {
        let (orchestrator, broker, backend) = harness().await;
        let saga = Saga::new(vec![
            SagaStep::new(sig("reserve"), Some(sig("release"))),
            SagaStep::new(sig("charge"), Some(sig("refund"))),
        ]);

        let run = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.run(saga).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        resolve_next(&broker, &backend, true).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        resolve_next(&broker, &backend, true).await;

        let saga = run.await.unwrap().unwrap();
        assert_eq!(saga.state, SagaState::Completed);
        assert!(saga.steps.iter().all(|s| s.state == SagaStepState::Completed));
    }

    #[tokio::test]
    async fn failed_step_compensates_prior_completed_steps_in_reverse() {
        let (orchestrator, broker, backend) = harness().await;
        let saga = Saga::new(vec![
            SagaStep::new(sig("reserve"), Some(sig("release"))),
            SagaStep::new(sig("charge"), Some(sig("refund"))),
            SagaStep::new(sig("ship"), Some(sig("cancel_shipment"))),
        ]);

        let run = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.run(saga).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        resolve_next(&broker, &backend, true).await; // reserve succeeds
        tokio::time::sleep(Duration::from_millis(10)).await;
        resolve_next(&broker, &backend, false).await; // charge fails
        tokio::time::sleep(Duration::from_millis(10)).await;
        resolve_next(&broker, &backend, true).await; // release (compensation) succeeds

        let saga = run.await.unwrap().unwrap();
        assert_eq!(saga.state, SagaState::Compensated);
        assert_eq!(saga.steps[0].state, SagaStepState::Compensated);
        assert_eq!(saga.steps[1].state, SagaStepState::Failed);
        assert_eq!(saga.steps[2].state, SagaStepState::Pending);
    }

    #[tokio::test]
    async fn saga_with_no_steps_is_rejected() {
        let (orchestrator, _broker, _backend) = harness().await;
        let err = orchestrator.run(Saga::new(vec![])).await.unwrap_err();
        assert!(matches!(err, CanvasError::EmptySaga(_)));
    }

    #[tokio::test]
    async fn a_compensation_that_fails_marks_the_saga_compensation_failed() {
        let (orchestrator, broker, backend) = harness().await;
        let saga = Saga::new(vec![
            SagaStep::new(sig("reserve"), Some(sig("release"))),
            SagaStep::new(sig("charge"), Some(sig("refund"))),
        ]);

        let run = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move { orchestrator.run(saga).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        resolve_next(&broker, &backend, true).await; // reserve succeeds
        tokio::time::sleep(Duration::from_millis(10)).await;
        resolve_next(&broker, &backend, false).await; // charge fails
        tokio::time::sleep(Duration::from_millis(10)).await;
        resolve_next(&broker, &backend, false).await; // release (compensation) fails too

        let saga = run.await.unwrap().unwrap();
        assert_eq!(saga.state, SagaState::CompensationFailed);
        assert_eq!(saga.steps[0].state, SagaStepState::CompensationFailed);
    }
}
