//! Crate-wide error taxonomy.
//!
//! Each subsystem owns a focused `thiserror` enum; [`TaskQueueError`] funnels
//! them behind one type for callers who don't need the fine-grained kind,
//! mirroring how the reference orchestration engine this design descends from
//! lets domain errors convert into a single top-level error via `#[from]`.

use uuid::Uuid;

use crate::model::state::TaskState;

pub type TaskQueueResult<T> = Result<T, TaskQueueError>;

/// Errors raised by the [`crate::broker::Broker`] contract.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("queue '{0}' is at capacity and the overflow policy is Wait")]
    QueueFull(String),
    #[error("queue '{0}' does not exist")]
    UnknownQueue(String),
    #[error("delivery receipt is no longer valid (already acked/nacked or expired)")]
    InvalidReceipt,
    #[error("broker is unavailable: {0}")]
    Unavailable(String),
    #[error("circuit breaker open for '{0}'")]
    CircuitBreakerOpen(String),
}

/// Errors raised by the [`crate::backend::ResultBackend`] contract.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("task '{0}' has no stored result")]
    NotFound(Uuid),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("backend is unavailable: {0}")]
    Unavailable(String),
    #[error("timed out waiting for result of task '{0}'")]
    WaitTimeout(Uuid),
    #[error("circuit breaker open for '{0}'")]
    CircuitBreakerOpen(String),
    #[error("database error: {0}")]
    Database(String),
}

/// A forbidden state-machine edge. Never becomes a task outcome; always
/// surfaced directly to the caller of `update_state`.
#[derive(Debug, thiserror::Error)]
#[error("illegal task state transition {from:?} -> {to:?} for task {task_id}")]
pub struct InvalidTransition {
    pub task_id: Uuid,
    pub from: Option<TaskState>,
    pub to: TaskState,
}

/// Errors from the [`crate::serializer`] contract.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("failed to serialize value: {0}")]
    Encode(String),
    #[error("failed to deserialize {expected} from {content_type}: {reason}")]
    Decode {
        expected: &'static str,
        content_type: String,
        reason: String,
    },
    #[error("no type info registered for '{0}' and no reflective fallback exists")]
    MissingTypeInfo(String),
}

/// Errors from the partition lock store.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("store is unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the revocation store.
#[derive(Debug, thiserror::Error)]
pub enum RevocationError {
    #[error("store is unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the outbox/inbox reliability substrate.
#[derive(Debug, thiserror::Error)]
pub enum ReliabilityError {
    #[error("outbox store is unavailable: {0}")]
    OutboxUnavailable(String),
    #[error("inbox store is unavailable: {0}")]
    InboxUnavailable(String),
    #[error("database error: {0}")]
    Database(String),
}

/// Errors surfaced by the worker executor while dispatching a task.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("task '{0}' is not registered")]
    UnknownTask(String),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error("soft time limit exceeded")]
    SoftTimeLimitExceeded,
    #[error("hard time limit exceeded")]
    TimeoutError,
    #[error("execution was cancelled")]
    OperationCanceled,
    #[error("handler requested retry: {reason}")]
    Retry {
        reason: String,
        countdown: Option<std::time::Duration>,
    },
    #[error("handler rejected the message: {reason}")]
    Reject { reason: String, requeue: bool },
    #[error("handler failed: {0}")]
    HandlerFailed(String),
}

/// Raised by `AsyncResult::get` when the terminal state is Failure or Rejected.
#[derive(Debug, thiserror::Error)]
#[error("task {task_id} finished in state {state:?}: {message}")]
pub struct TaskExecutionException {
    pub task_id: Uuid,
    pub state: TaskState,
    pub message: String,
}

/// Errors from the beat scheduler.
#[derive(Debug, thiserror::Error)]
pub enum BeatError {
    #[error("invalid cron expression '{0}': {1}")]
    InvalidCron(String, String),
    #[error("failed to persist schedule state to {path}: {reason}")]
    PersistFailed { path: String, reason: String },
    #[error("failed to load schedule state from {path}: {reason}")]
    LoadFailed { path: String, reason: String },
    #[error(transparent)]
    Client(#[from] Box<TaskQueueError>),
}

/// Errors from canvas/saga composition.
#[derive(Debug, thiserror::Error)]
pub enum CanvasError {
    #[error("saga '{0}' has no steps")]
    EmptySaga(Uuid),
    #[error("chain has no steps")]
    EmptyChain,
    #[error("group has no children")]
    EmptyGroup,
    #[error("saga '{saga_id}' step {index} cannot transition {from:?} -> {to:?}")]
    InvalidSagaTransition {
        saga_id: Uuid,
        index: usize,
        from: String,
        to: String,
    },
    #[error("saga '{saga_id}' cannot transition {from:?} -> {to:?}")]
    InvalidSagaState { saga_id: Uuid, from: String, to: String },
    #[error(transparent)]
    Client(#[from] Box<TaskQueueError>),
}

/// Errors from the router.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("tenant '{0}' is not in the configured allow-list")]
    TenantNotAllowed(String),
}

/// Top-level umbrella error. Fine-grained subsystem errors convert in via `#[from]`.
#[derive(Debug, thiserror::Error)]
pub enum TaskQueueError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Revocation(#[from] RevocationError),
    #[error(transparent)]
    Reliability(#[from] ReliabilityError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error(transparent)]
    TaskExecution(#[from] TaskExecutionException),
    #[error(transparent)]
    Beat(#[from] BeatError),
    #[error(transparent)]
    Canvas(#[from] CanvasError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error("invalid send options: {0}")]
    InvalidSendOptions(String),
    #[error("configuration error: {0}")]
    Config(String),
}
