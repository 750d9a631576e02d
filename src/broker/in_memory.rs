//! In-memory reference [`Broker`] implementation.
//!
//! Grounded on the bounded, policy-driven queue described in §4.2: a
//! fixed-capacity FIFO per queue, ordered by descending priority with
//! insertion-order tie-break, and one of `Wait`/`DropWrite`/`DropOldest` when
//! the queue is full.

use async_trait::async_trait;
use dashmap::DashMap;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

use super::{Broker, Delivery, OverflowPolicy, QueueOptions, QueueStats, ReceiptHandle};
use crate::error::BrokerError;
use crate::model::TaskMessage;

#[derive(Debug)]
struct Entry {
    priority: u8,
    sequence: u64,
    message: TaskMessage,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority first, then the *smaller*
        // sequence number (older message) wins ties, so reverse it here.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    options: QueueOptions,
    ready: BinaryHeap<Entry>,
    in_flight: HashMap<u64, (String, TaskMessage)>,
}

#[derive(Debug)]
struct QueueState {
    inner: Mutex<QueueInner>,
    not_full: Notify,
}

/// An in-memory [`Broker`]. Default per-queue capacity 10 000 with [`OverflowPolicy::Wait`].
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    queues: Arc<DashMap<String, Arc<QueueState>>>,
    next_receipt: Arc<AtomicU64>,
    next_sequence: Arc<AtomicU64>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: Arc::new(DashMap::new()),
            next_receipt: Arc::new(AtomicU64::new(1)),
            next_sequence: Arc::new(AtomicU64::new(1)),
        }
    }

    fn queue_or_default(&self, queue: &str) -> Arc<QueueState> {
        self.queues
            .entry(queue.to_string())
            .or_insert_with(|| {
                Arc::new(QueueState {
                    inner: Mutex::new(QueueInner {
                        options: QueueOptions::default(),
                        ready: BinaryHeap::new(),
                        in_flight: HashMap::new(),
                    }),
                    not_full: Notify::new(),
                })
            })
            .clone()
    }

    fn get_queue(&self, queue: &str) -> Result<Arc<QueueState>, BrokerError> {
        self.queues
            .get(queue)
            .map(|q| q.clone())
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_string()))
    }

    async fn requeue_after_delay(&self, queue: String, message: TaskMessage, delay: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = this.publish_to(&queue, message).await;
        });
    }

    async fn publish_to(&self, queue: &str, message: TaskMessage) -> Result<(), BrokerError> {
        let state = self.queue_or_default(queue);
        loop {
            let mut inner = state.inner.lock().await;
            let capacity = inner.options.capacity;
            let occupied = inner.ready.len() + inner.in_flight.len();
            if occupied < capacity {
                let sequence = self.next_sequence.fetch_add(1, AtomicOrdering::Relaxed);
                inner.ready.push(Entry {
                    priority: message.priority,
                    sequence,
                    message,
                });
                drop(inner);
                state.not_full.notify_waiters();
                return Ok(());
            }
            match inner.options.overflow_policy {
                OverflowPolicy::DropWrite => {
                    return Err(BrokerError::QueueFull(queue.to_string()));
                }
                OverflowPolicy::DropOldest => {
                    inner.ready.pop();
                    let sequence = self.next_sequence.fetch_add(1, AtomicOrdering::Relaxed);
                    inner.ready.push(Entry {
                        priority: message.priority,
                        sequence,
                        message,
                    });
                    return Ok(());
                }
                OverflowPolicy::Wait => {
                    drop(inner);
                    state.not_full.notified().await;
                    // loop and retry
                }
            }
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError> {
        let state = self.queue_or_default(queue);
        state.inner.lock().await.options = options;
        Ok(())
    }

    async fn publish(&self, message: TaskMessage) -> Result<(), BrokerError> {
        let queue = message.queue.clone();
        self.publish_to(&queue, message).await
    }

    async fn consume(&self, queues: &[String], max: usize) -> Result<Vec<Delivery>, BrokerError> {
        let mut out = Vec::with_capacity(max);
        for queue in queues {
            if out.len() >= max {
                break;
            }
            let state = self.queue_or_default(queue);
            let mut inner = state.inner.lock().await;
            while out.len() < max {
                let Some(entry) = inner.ready.pop() else {
                    break;
                };
                let receipt_id = self.next_receipt.fetch_add(1, AtomicOrdering::Relaxed);
                let receipt = ReceiptHandle(receipt_id);
                inner
                    .in_flight
                    .insert(receipt_id, (queue.clone(), entry.message.clone()));
                out.push(Delivery {
                    message: entry.message,
                    receipt,
                });
            }
            drop(inner);
            state.not_full.notify_waiters();
        }
        Ok(out)
    }

    async fn ack(&self, queue: &str, receipt: ReceiptHandle) -> Result<(), BrokerError> {
        let state = self.get_queue(queue)?;
        let mut inner = state.inner.lock().await;
        inner
            .in_flight
            .remove(&receipt.0)
            .ok_or(BrokerError::InvalidReceipt)?;
        drop(inner);
        state.not_full.notify_waiters();
        Ok(())
    }

    async fn nack(
        &self,
        queue: &str,
        receipt: ReceiptHandle,
        requeue: bool,
        delay: Option<Duration>,
    ) -> Result<(), BrokerError> {
        let state = self.get_queue(queue)?;
        let mut inner = state.inner.lock().await;
        let (_, message) = inner
            .in_flight
            .remove(&receipt.0)
            .ok_or(BrokerError::InvalidReceipt)?;
        drop(inner);
        state.not_full.notify_waiters();

        if requeue {
            match delay {
                Some(d) if !d.is_zero() => {
                    self.requeue_after_delay(queue.to_string(), message, d).await;
                }
                _ => {
                    self.publish_to(queue, message).await?;
                }
            }
        }
        Ok(())
    }

    async fn queue_length(&self, queue: &str) -> Result<usize, BrokerError> {
        let state = self.get_queue(queue)?;
        Ok(state.inner.lock().await.ready.len())
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, BrokerError> {
        let state = self.get_queue(queue)?;
        let inner = state.inner.lock().await;
        Ok(QueueStats {
            length: inner.ready.len(),
            in_flight: inner.in_flight.len(),
        })
    }

    async fn health_check(&self) -> Result<bool, BrokerError> {
        Ok(true)
    }
}
