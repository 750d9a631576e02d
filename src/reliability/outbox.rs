//! # Outbox (§4.6)
//!
//! `append` is meant to be called inside the caller's own durable
//! transaction; the [`OutboxDispatcher`] is the background poller that
//! drains `Pending` rows to the broker in `sequence_number` order, with
//! exponential backoff on publish failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::broker::Broker;
use crate::error::ReliabilityError;
use crate::model::{OutboxEntry, OutboxStatus, TaskMessage};

#[async_trait]
pub trait OutboxStore: Send + Sync + std::fmt::Debug {
    /// Assigns the next `sequence_number` and stores the entry as `Pending`.
    async fn append(&self, task_message: TaskMessage) -> Result<OutboxEntry, ReliabilityError>;

    /// `Pending` rows whose backoff has elapsed, oldest `sequence_number` first.
    async fn fetch_ready(&self, limit: usize) -> Result<Vec<OutboxEntry>, ReliabilityError>;

    async fn mark_dispatched(&self, id: Uuid) -> Result<(), ReliabilityError>;

    /// Record a failed publish attempt. Once `attempts` reaches `max_retries`
    /// the row moves to `Failed` and is no longer returned by `fetch_ready`.
    async fn mark_retry(
        &self,
        id: Uuid,
        error: String,
        max_retries: u32,
        backoff: Duration,
    ) -> Result<(), ReliabilityError>;
}

struct Row {
    entry: OutboxEntry,
    next_attempt_at: DateTime<Utc>,
}

/// An in-memory [`OutboxStore`].
#[derive(Debug)]
pub struct InMemoryOutboxStore {
    rows: DashMap<Uuid, Row>,
    next_sequence: AtomicI64,
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            next_sequence: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(&self, task_message: TaskMessage) -> Result<OutboxEntry, ReliabilityError> {
        let sequence_number = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let entry = OutboxEntry::new(task_message, sequence_number);
        self.rows.insert(
            entry.id,
            Row {
                entry: entry.clone(),
                next_attempt_at: entry.created_at,
            },
        );
        Ok(entry)
    }

    async fn fetch_ready(&self, limit: usize) -> Result<Vec<OutboxEntry>, ReliabilityError> {
        let now = Utc::now();
        let mut ready: Vec<OutboxEntry> = self
            .rows
            .iter()
            .filter(|row| row.entry.status == OutboxStatus::Pending && row.next_attempt_at <= now)
            .map(|row| row.entry.clone())
            .collect();
        ready.sort_by_key(|entry| entry.sequence_number);
        ready.truncate(limit);
        Ok(ready)
    }

    async fn mark_dispatched(&self, id: Uuid) -> Result<(), ReliabilityError> {
        if let Some(mut row) = self.rows.get_mut(&id) {
            row.entry.status = OutboxStatus::Dispatched;
            row.entry.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: Uuid,
        error: String,
        max_retries: u32,
        backoff: Duration,
    ) -> Result<(), ReliabilityError> {
        if let Some(mut row) = self.rows.get_mut(&id) {
            row.entry.attempts += 1;
            row.entry.last_error = Some(error);
            row.entry.updated_at = Utc::now();
            if row.entry.attempts >= max_retries {
                row.entry.status = OutboxStatus::Failed;
            } else {
                let delay = backoff.saturating_mul(2u32.saturating_pow(row.entry.attempts.saturating_sub(1)));
                row.next_attempt_at =
                    Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OutboxDispatcherConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for OutboxDispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            max_retries: 5,
            base_backoff: Duration::from_secs(1),
        }
    }
}

/// Polls an [`OutboxStore`] and publishes ready entries to a [`Broker`].
#[derive(Debug)]
pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    config: OutboxDispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(store: Arc<dyn OutboxStore>, broker: Arc<dyn Broker>, config: OutboxDispatcherConfig) -> Self {
        Self { store, broker, config }
    }

    /// Drain one batch of ready entries. Returns the number dispatched.
    pub async fn tick(&self) -> Result<usize, ReliabilityError> {
        let ready = self.store.fetch_ready(self.config.batch_size).await?;
        let mut dispatched = 0;
        for entry in ready {
            match self.broker.publish(entry.task_message.clone()).await {
                Ok(()) => {
                    self.store.mark_dispatched(entry.id).await?;
                    dispatched += 1;
                }
                Err(err) => {
                    self.store
                        .mark_retry(entry.id, err.to_string(), self.config.max_retries, self.config.base_backoff)
                        .await?;
                }
            }
        }
        Ok(dispatched)
    }

    /// Run [`Self::tick`] on `poll_interval` until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            loop {
                ticker.tick().await;
                if let Err(err) = self.tick().await {
                    tracing::warn!(%err, "outbox dispatch tick failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, QueueOptions};

    fn msg(task: &str, queue: &str) -> TaskMessage {
        TaskMessage::new(task, queue, vec![])
    }

    #[tokio::test]
    async fn append_assigns_monotonic_sequence_numbers() {
        let store = InMemoryOutboxStore::new();
        let a = store.append(msg("a", "q")).await.unwrap();
        let b = store.append(msg("b", "q")).await.unwrap();
        assert!(b.sequence_number > a.sequence_number);
    }

    #[tokio::test]
    async fn fetch_ready_orders_by_sequence_number() {
        let store = InMemoryOutboxStore::new();
        store.append(msg("a", "q")).await.unwrap();
        store.append(msg("b", "q")).await.unwrap();
        let ready = store.fetch_ready(10).await.unwrap();
        assert_eq!(ready.len(), 2);
        assert!(ready[0].sequence_number < ready[1].sequence_number);
    }

    #[tokio::test]
    async fn dispatcher_publishes_and_marks_dispatched() {
        let store = Arc::new(InMemoryOutboxStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_queue("q", QueueOptions::default()).await.unwrap();
        store.append(msg("a", "q")).await.unwrap();

        let dispatcher = OutboxDispatcher::new(store.clone(), broker.clone(), OutboxDispatcherConfig::default());
        let dispatched = dispatcher.tick().await.unwrap();
        assert_eq!(dispatched, 1);
        assert_eq!(store.fetch_ready(10).await.unwrap().len(), 0);
        assert_eq!(broker.queue_length("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn retry_exhaustion_marks_entry_failed() {
        let store = InMemoryOutboxStore::new();
        let entry = store.append(msg("a", "q")).await.unwrap();
        for _ in 0..5 {
            store
                .mark_retry(entry.id, "boom".to_string(), 5, Duration::from_millis(1))
                .await
                .unwrap();
        }
        assert_eq!(store.fetch_ready(10).await.unwrap().len(), 0);
    }
}
