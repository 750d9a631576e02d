//! # Delayed-message dispatcher (§4.7)
//!
//! Holds `(due_at, message)` pairs and moves due messages to the broker in
//! due-at order on a fixed-resolution tick. `countdown`/`eta` in
//! `SendOptions` are converted to an absolute due time by the caller before
//! [`DelayedDispatcher::schedule`] is invoked.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::broker::Broker;
use crate::error::BrokerError;
use crate::model::TaskMessage;

struct DueEntry {
    due_at: DateTime<Utc>,
    sequence: u64,
    message: TaskMessage,
}

impl PartialEq for DueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due_at == other.due_at && self.sequence == other.sequence
    }
}
impl Eq for DueEntry {}

impl PartialOrd for DueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want the earliest due_at (and, on a
        // tie, the earliest insertion) to come out first, so reverse both.
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Default tick resolution (§4.7).
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// A single-threaded ticker that moves due `(due_at, message)` pairs to a
/// [`Broker`] in due-at order, insertion-order on ties.
#[derive(Debug)]
pub struct DelayedDispatcher {
    pending: Mutex<BinaryHeap<DueEntry>>,
    next_sequence: AtomicU64,
    broker: Arc<dyn Broker>,
    tick: Duration,
}

impl DelayedDispatcher {
    pub fn new(broker: Arc<dyn Broker>, tick: Duration) -> Self {
        Self {
            pending: Mutex::new(BinaryHeap::new()),
            next_sequence: AtomicU64::new(1),
            broker,
            tick,
        }
    }

    pub async fn schedule(&self, due_at: DateTime<Utc>, message: TaskMessage) {
        let sequence = self.next_sequence.fetch_add(1, AtomicOrdering::Relaxed);
        self.pending.lock().await.push(DueEntry { due_at, sequence, message });
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Publish every entry whose `due_at` has passed. Returns the count published.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<usize, BrokerError> {
        let mut dispatched = 0;
        loop {
            let next = {
                let mut pending = self.pending.lock().await;
                match pending.peek() {
                    Some(entry) if entry.due_at <= now => pending.pop(),
                    _ => None,
                }
            };
            let Some(entry) = next else { break };
            self.broker.publish(entry.message).await?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Run [`Self::dispatch_due`] on the configured tick resolution until aborted.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.tick);
            loop {
                ticker.tick().await;
                if let Err(err) = self.dispatch_due(Utc::now()).await {
                    tracing::warn!(%err, "delayed dispatcher tick failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, QueueOptions};

    fn msg(task: &str) -> TaskMessage {
        TaskMessage::new(task, "q", vec![])
    }

    #[tokio::test]
    async fn only_due_messages_are_dispatched() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_queue("q", QueueOptions::default()).await.unwrap();
        let dispatcher = DelayedDispatcher::new(broker.clone(), DEFAULT_TICK);

        let now = Utc::now();
        dispatcher.schedule(now - chrono::Duration::seconds(1), msg("past")).await;
        dispatcher.schedule(now + chrono::Duration::hours(1), msg("future")).await;

        let dispatched = dispatcher.dispatch_due(now).await.unwrap();
        assert_eq!(dispatched, 1);
        assert_eq!(dispatcher.pending_count().await, 1);
        assert_eq!(broker.queue_length("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn due_messages_dispatch_in_due_at_order() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_queue("q", QueueOptions::default()).await.unwrap();
        let dispatcher = DelayedDispatcher::new(broker.clone(), DEFAULT_TICK);

        let now = Utc::now();
        dispatcher.schedule(now - chrono::Duration::seconds(1), msg("second")).await;
        dispatcher.schedule(now - chrono::Duration::seconds(5), msg("first")).await;

        dispatcher.dispatch_due(now).await.unwrap();
        let deliveries = broker.consume(&["q".to_string()], 10).await.unwrap();
        assert_eq!(deliveries[0].message.task, "first");
        assert_eq!(deliveries[1].message.task, "second");
    }

    #[tokio::test]
    async fn ties_broken_by_insertion_order() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_queue("q", QueueOptions::default()).await.unwrap();
        let dispatcher = DelayedDispatcher::new(broker.clone(), DEFAULT_TICK);

        let due_at = Utc::now() - chrono::Duration::seconds(1);
        dispatcher.schedule(due_at, msg("a")).await;
        dispatcher.schedule(due_at, msg("b")).await;

        dispatcher.dispatch_due(Utc::now()).await.unwrap();
        let deliveries = broker.consume(&["q".to_string()], 10).await.unwrap();
        assert_eq!(deliveries[0].message.task, "a");
        assert_eq!(deliveries[1].message.task, "b");
    }
}
