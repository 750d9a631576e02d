//! # Client (§4.16 / §6 "Client API")
//!
//! Submits tasks, hands back an [`AsyncResult`] handle, and revokes them.
//! Send validation uses the `validator` crate, matching the ambient-stack
//! convention of validating user input at the boundary.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::backend::ResultBackend;
use crate::broker::Broker;
use crate::delayed::DelayedDispatcher;
use crate::error::{TaskExecutionException, TaskQueueError, TaskQueueResult};
use crate::model::{Outcome, RevokeOptions, TaskMessage, TaskState};
use crate::router::Router;
use crate::serializer::{deserialize_typed, serialize_typed, Serializer};
use crate::stores::RevocationStore;

/// Options accepted by [`Client::send`]. `countdown` and `eta` express the
/// same intent (a delay before the message becomes due); when both are
/// set, `countdown` wins.
#[derive(Debug, Clone, Default, Validate)]
pub struct SendOptions {
    pub eta: Option<DateTime<Utc>>,
    pub countdown: Option<Duration>,
    pub expires: Option<DateTime<Utc>>,
    pub queue: Option<String>,
    #[validate(range(min = 0, max = 9))]
    pub priority: Option<u8>,
    pub max_retries: Option<u32>,
    pub task_id: Option<Uuid>,
    pub correlation_id: Option<Uuid>,
    pub headers: std::collections::HashMap<String, String>,
}

impl SendOptions {
    /// Resolves the effective due time from `countdown`/`eta`, and checks
    /// `expires >= effective_eta` — the one cross-field rule `validator`'s
    /// derive can't express on its own.
    fn effective_eta(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match (&self.countdown, &self.eta) {
            (Some(countdown), _) => Some(now + chrono::Duration::from_std(*countdown).unwrap_or(chrono::Duration::zero())),
            (None, Some(eta)) => Some(*eta),
            (None, None) => None,
        }
    }

    fn check(&self, now: DateTime<Utc>) -> Result<(), TaskQueueError> {
        self.validate().map_err(|e| TaskQueueError::InvalidSendOptions(e.to_string()))?;
        if let Some(expires) = self.expires {
            let eta = self.effective_eta(now).unwrap_or(now);
            if expires < eta {
                return Err(TaskQueueError::InvalidSendOptions(
                    "expires must be >= the effective eta".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// A handle to a submitted task's eventual result.
pub struct AsyncResult<Output> {
    task_id: Uuid,
    backend: Arc<dyn ResultBackend>,
    serializer: Arc<dyn Serializer>,
    _marker: PhantomData<fn() -> Output>,
}

impl<Output> AsyncResult<Output>
where
    Output: DeserializeOwned,
{
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    /// Blocks until a terminal result exists or `timeout` elapses. Returns
    /// `Ok(output)` on `Success`; any other terminal state is surfaced as
    /// `TaskExecutionException` carrying the stored result's state.
    pub async fn get(&self, timeout: Duration) -> TaskQueueResult<Output> {
        let result = self.backend.wait_for_result(self.task_id, timeout).await?;
        if result.state != TaskState::Success {
            let message = match &result.outcome {
                Some(Outcome::Exception(exception)) => exception.message.clone(),
                _ => format!("task finished in state {:?}", result.state),
            };
            return Err(TaskExecutionException { task_id: self.task_id, state: result.state, message }.into());
        }
        match result.outcome {
            Some(Outcome::Result { bytes, .. }) => {
                Ok(deserialize_typed(self.serializer.as_ref(), &bytes).map_err(TaskQueueError::from)?)
            }
            _ => Err(TaskExecutionException {
                task_id: self.task_id,
                state: result.state,
                message: "success result carried no payload".to_string(),
            }
            .into()),
        }
    }
}

/// Submits tasks, resolves their destination queue, and revokes them.
#[derive(Clone)]
pub struct Client {
    broker: Arc<dyn Broker>,
    backend: Arc<dyn ResultBackend>,
    revocations: Arc<dyn RevocationStore>,
    router: Arc<Router>,
    serializer: Arc<dyn Serializer>,
    delayed: Option<Arc<DelayedDispatcher>>,
}

impl Client {
    pub fn new(
        broker: Arc<dyn Broker>,
        backend: Arc<dyn ResultBackend>,
        revocations: Arc<dyn RevocationStore>,
        router: Arc<Router>,
        serializer: Arc<dyn Serializer>,
    ) -> Self {
        Self { broker, backend, revocations, router, serializer, delayed: None }
    }

    /// Routes `eta`/`countdown`-bearing sends through `dispatcher` (§4.7)
    /// instead of publishing them to the broker immediately.
    pub fn with_delayed_dispatcher(mut self, dispatcher: Arc<DelayedDispatcher>) -> Self {
        self.delayed = Some(dispatcher);
        self
    }

    /// Submits `task_name(input)`, returning a typed handle to its result.
    pub async fn send<Input, Output>(
        &self,
        task_name: &str,
        input: Input,
        options: SendOptions,
    ) -> TaskQueueResult<AsyncResult<Output>>
    where
        Input: Serialize + Send,
        Output: DeserializeOwned,
    {
        let now = Utc::now();
        options.check(now)?;
        let args = serialize_typed(self.serializer.as_ref(), &input)?;
        let content_type = self.serializer.content_type().to_string();
        let task_id = self.submit(task_name, args, &content_type, options, now).await?;

        Ok(AsyncResult {
            task_id,
            backend: self.backend.clone(),
            serializer: self.serializer.clone(),
            _marker: PhantomData,
        })
    }

    /// Submits pre-serialized `args` for `task_name`, applying the same
    /// routing and `Pending`-state write as [`Client::send`]. For callers
    /// that already hold an encoded [`crate::model::TaskSignature`] rather
    /// than a typed `Input` — the beat scheduler is the only one today.
    pub async fn send_raw(
        &self,
        task_name: &str,
        args: Vec<u8>,
        content_type: &str,
        options: SendOptions,
    ) -> TaskQueueResult<Uuid> {
        let now = Utc::now();
        options.check(now)?;
        self.submit(task_name, args, content_type, options, now).await
    }

    async fn submit(
        &self,
        task_name: &str,
        args: Vec<u8>,
        content_type: &str,
        options: SendOptions,
        now: DateTime<Utc>,
    ) -> TaskQueueResult<Uuid> {
        let queue = options.queue.clone().unwrap_or_else(|| self.router.queue(task_name, None));

        let mut message = TaskMessage::new(task_name, queue, args);
        if let Some(task_id) = options.task_id {
            message.id = task_id;
        }
        message.content_type = content_type.to_string();
        message.eta = options.effective_eta(now);
        message.expires = options.expires;
        message.priority = options.priority.unwrap_or(message.priority);
        message.max_retries = options.max_retries;
        message.correlation_id = options.correlation_id;
        message.headers = options.headers;

        let task_id = message.id;
        self.backend.update_state(task_id, TaskState::Pending, None).await?;
        match (&self.delayed, message.eta) {
            (Some(dispatcher), Some(eta)) if eta > now => {
                dispatcher.schedule(eta, message).await;
            }
            _ => {
                self.broker.publish(message).await?;
            }
        }

        Ok(task_id)
    }

    pub async fn revoke(&self, task_id: Uuid, options: RevokeOptions) -> TaskQueueResult<()> {
        self.revocations.revoke(task_id, options, None).await?;
        Ok(())
    }

    pub async fn revoke_batch(&self, task_ids: &[Uuid], options: RevokeOptions) -> TaskQueueResult<()> {
        self.revocations.revoke_batch(task_ids, options, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::broker::{InMemoryBroker, QueueOptions};
    use crate::serializer::JsonSerializer;
    use crate::stores::InMemoryRevocationStore;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Greeting {
        hello: String,
    }

    async fn client() -> (Client, Arc<InMemoryBroker>, Arc<InMemoryBackend>) {
        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_queue("celery", QueueOptions::default()).await.unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let client = Client::new(
            broker.clone(),
            backend.clone(),
            Arc::new(InMemoryRevocationStore::new()),
            Arc::new(Router::new()),
            Arc::new(JsonSerializer),
        );
        (client, broker, backend)
    }

    #[tokio::test]
    async fn send_publishes_to_the_default_queue_and_marks_pending() {
        let (client, broker, backend) = client().await;
        let result: AsyncResult<Greeting> = client
            .send("greet", Greeting { hello: "world".to_string() }, SendOptions::default())
            .await
            .unwrap();
        assert_eq!(broker.queue_length("celery").await.unwrap(), 1);
        assert_eq!(backend.get_state(result.task_id()).await.unwrap(), Some(TaskState::Pending));
    }

    #[tokio::test]
    async fn send_rejects_priority_out_of_range() {
        let (client, _broker, _backend) = client().await;
        let err = client
            .send::<_, Greeting>("greet", Greeting { hello: "x".to_string() }, SendOptions { priority: Some(42), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, TaskQueueError::InvalidSendOptions(_)));
    }

    #[tokio::test]
    async fn send_rejects_expires_before_effective_eta() {
        let (client, _broker, _backend) = client().await;
        let now = Utc::now();
        let options = SendOptions {
            eta: Some(now + chrono::Duration::hours(1)),
            expires: Some(now),
            ..Default::default()
        };
        let err = client.send::<_, Greeting>("greet", Greeting { hello: "x".to_string() }, options).await.unwrap_err();
        assert!(matches!(err, TaskQueueError::InvalidSendOptions(_)));
    }

    #[tokio::test]
    async fn get_returns_deserialized_output_once_stored() {
        let (client, broker, backend) = client().await;
        let result: AsyncResult<Greeting> = client
            .send("greet", Greeting { hello: "world".to_string() }, SendOptions::default())
            .await
            .unwrap();
        let task_id = result.task_id();

        let delivery = broker.consume(&["celery".to_string()], 1).await.unwrap().remove(0);
        let output = Greeting { hello: "world".to_string() };
        let bytes = serialize_typed(&JsonSerializer, &output).unwrap();
        backend.update_state(task_id, TaskState::Received, None).await.unwrap();
        backend.update_state(task_id, TaskState::Started, None).await.unwrap();
        let stored = crate::model::TaskResult::success(task_id, bytes, "application/json", Duration::from_millis(1), 0, None);
        backend.store(stored).await.unwrap();
        broker.ack("celery", delivery.receipt).await.unwrap();

        let fetched = result.get(Duration::from_secs(1)).await.unwrap();
        assert_eq!(fetched, output);
    }

    #[tokio::test]
    async fn delayed_send_is_held_back_until_due() {
        let (client, broker, _backend) = client().await;
        let dispatcher = Arc::new(DelayedDispatcher::new(broker.clone(), Duration::from_millis(10)));
        let client = client.with_delayed_dispatcher(dispatcher.clone());

        let options = SendOptions { countdown: Some(Duration::from_secs(3600)), ..Default::default() };
        let _result: AsyncResult<Greeting> = client
            .send("greet", Greeting { hello: "later".to_string() }, options)
            .await
            .unwrap();

        // Not published yet: it's parked in the delayed dispatcher.
        assert_eq!(broker.queue_length("celery").await.unwrap(), 0);
        assert_eq!(dispatcher.pending_count().await, 1);

        dispatcher.dispatch_due(Utc::now() + chrono::Duration::hours(2)).await.unwrap();
        assert_eq!(broker.queue_length("celery").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn revoke_is_observed_by_the_revocation_store() {
        let (client, _broker, _backend) = client().await;
        let task_id = Uuid::now_v7();
        client.revoke(task_id, RevokeOptions::default()).await.unwrap();
        assert!(client.revocations.is_revoked(task_id).await.unwrap());
    }
}
