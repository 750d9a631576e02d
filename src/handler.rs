//! Handler context and outcome types shared by the registry, filter
//! pipeline, and executor (§4.8, §4.10, §4.12, §9 design note on
//! cooperative signalling).

use std::time::Duration;
use uuid::Uuid;

/// Per-invocation context passed to a task handler and to every filter.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub task_name: String,
    pub retries: u32,
    pub correlation_id: Option<Uuid>,
    pub tenant_id: Option<String>,
    /// Cancelled by external cancellation (revocation with `immediate`,
    /// host shutdown, explicit revoke-with-terminate) or by a hard
    /// time-limit expiry.
    pub cancellation: tokio_util::sync::CancellationToken,
    /// Cancelled when the soft time limit fires, independent of
    /// `cancellation`, so user code can clean up before the hard limit
    /// tears the handler down.
    pub soft_limit: tokio_util::sync::CancellationToken,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn is_soft_limit_exceeded(&self) -> bool {
        self.soft_limit.is_cancelled()
    }
}

/// What a handler invocation produced. Cooperative signalling (retry,
/// reject, soft-limit notice) is modeled as tagged variants rather than
/// exceptions, so it is tied to no particular language's exception
/// mechanism.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// Handler completed; `bytes` is the serialized output.
    Success { bytes: Vec<u8>, content_type: String },
    /// Handler asked to be retried, e.g. after a transient downstream failure.
    Retry {
        reason: String,
        countdown: Option<Duration>,
    },
    /// Handler asked for the message to be rejected outright.
    Reject { reason: String, requeue: bool },
    /// Handler raised an application error; maps to a Failure result.
    Failure {
        exception_type: String,
        message: String,
        stack: Option<String>,
    },
    /// The soft time limit fired while the handler kept running past it
    /// without returning. Treated as Failure unless the handler's own
    /// retry logic already produced a different outcome first.
    SoftTimeLimitExceeded,
    /// The hard time limit fired and the handler was torn down. Maps to Failure.
    TimedOut,
    /// External cancellation (revocation, shutdown) preempted the handler.
    /// Maps to Revoked, never Failure.
    Cancelled,
}

/// A registered task implementation, type-erased over its serialized
/// input/output so heterogeneous handlers can share one registry (§9:
/// "type-erased handler descriptor... behind a thin typed façade").
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    async fn call(&self, ctx: &TaskContext, args: &[u8]) -> HandlerOutcome;
}

/// Adapts an `Fn(Input) -> Result<Output, (type, message)>`-shaped closure
/// into a type-erased [`TaskHandler`], (de)serializing through a
/// [`crate::serializer::Serializer`]. This is the "thin typed façade" the
/// design notes call for.
pub struct FnHandler<F> {
    serializer: std::sync::Arc<dyn crate::serializer::Serializer>,
    func: F,
}

impl<F> FnHandler<F> {
    pub fn new(serializer: std::sync::Arc<dyn crate::serializer::Serializer>, func: F) -> Self {
        Self { serializer, func }
    }
}

#[async_trait::async_trait]
impl<F, Fut, Input, Output> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext, Input) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Output, (String, String)>> + Send,
    Input: serde::de::DeserializeOwned + Send,
    Output: serde::Serialize + Send,
{
    async fn call(&self, ctx: &TaskContext, args: &[u8]) -> HandlerOutcome {
        let input: Input = match crate::serializer::deserialize_typed(self.serializer.as_ref(), args) {
            Ok(value) => value,
            Err(err) => {
                return HandlerOutcome::Failure {
                    exception_type: "SerializationError".to_string(),
                    message: err.to_string(),
                    stack: None,
                }
            }
        };
        match (self.func)(ctx.clone(), input).await {
            Ok(output) => match crate::serializer::serialize_typed(self.serializer.as_ref(), &output) {
                Ok(bytes) => HandlerOutcome::Success {
                    bytes,
                    content_type: self.serializer.content_type().to_string(),
                },
                Err(err) => HandlerOutcome::Failure {
                    exception_type: "SerializationError".to_string(),
                    message: err.to_string(),
                    stack: None,
                },
            },
            Err((exception_type, message)) => HandlerOutcome::Failure {
                exception_type,
                message,
                stack: None,
            },
        }
    }
}
