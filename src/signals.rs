//! In-process signal bus (§4.12 step 12, §2.2 supplement).
//!
//! A `tokio::sync::broadcast` fan-out of terminal task events, driving
//! Batch/Saga progression without coupling the executor to either.

use uuid::Uuid;

use crate::model::TaskState;

/// Emitted once a task reaches a terminal state. `state` is always one of
/// [`TaskState::TERMINAL`].
#[derive(Debug, Clone)]
pub struct TaskSignal {
    pub task_id: Uuid,
    pub state: TaskState,
    pub correlation_id: Option<Uuid>,
}

/// Shared sender/receiver-factory for [`TaskSignal`] events.
#[derive(Debug, Clone)]
pub struct SignalBus {
    sender: tokio::sync::broadcast::Sender<TaskSignal>,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl SignalBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TaskSignal> {
        self.sender.subscribe()
    }

    /// Publish a terminal-state signal. Returns the number of active
    /// receivers notified; no receivers is not an error.
    pub fn publish(&self, signal: TaskSignal) -> usize {
        self.sender.send(signal).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_observes_published_signal() {
        let bus = SignalBus::default();
        let mut rx = bus.subscribe();
        let task_id = Uuid::now_v7();
        bus.publish(TaskSignal { task_id, state: TaskState::Success, correlation_id: None });
        let signal = rx.recv().await.unwrap();
        assert_eq!(signal.task_id, task_id);
        assert_eq!(signal.state, TaskState::Success);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let bus = SignalBus::default();
        let notified = bus.publish(TaskSignal { task_id: Uuid::now_v7(), state: TaskState::Failure, correlation_id: None });
        assert_eq!(notified, 0);
    }
}
