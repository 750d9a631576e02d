//! # Broker contract (§4.2)
//!
//! Publish/consume/ack/nack/delay, with queue-metric hooks. Ordering is
//! best-effort FIFO per queue, modulated by descending priority. Queues are
//! bounded with a configurable overflow policy.

pub mod circuit_breaker;
pub mod in_memory;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::BrokerError;
use crate::model::TaskMessage;

pub use circuit_breaker::CircuitBreakerBroker;
pub use in_memory::InMemoryBroker;

/// What happens to `publish` when a queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum OverflowPolicy {
    /// Block (async-wait) until space is available.
    #[default]
    Wait,
    /// Reject the new write immediately.
    DropWrite,
    /// Evict the oldest queued message to make room for the new one.
    DropOldest,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct QueueOptions {
    pub capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            overflow_policy: OverflowPolicy::Wait,
        }
    }
}

/// A handle to one leased message. Must be presented back to `ack`/`nack`;
/// the broker is free to reject a receipt it no longer recognizes
/// (already acked, or the queue was recreated).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReceiptHandle(pub u64);

#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: TaskMessage,
    pub receipt: ReceiptHandle,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub length: usize,
    pub in_flight: usize,
}

/// The broker contract. Implementations must provide at-least-once delivery
/// semantics: a message is only removed from the queue on `ack`.
#[async_trait]
pub trait Broker: Send + Sync + std::fmt::Debug {
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), BrokerError>;

    async fn publish(&self, message: TaskMessage) -> Result<(), BrokerError>;

    /// Lease up to `max` messages from the highest-priority, oldest-first
    /// positions across `queues`, in the order queues are listed.
    async fn consume(&self, queues: &[String], max: usize) -> Result<Vec<Delivery>, BrokerError>;

    async fn ack(&self, queue: &str, receipt: ReceiptHandle) -> Result<(), BrokerError>;

    async fn nack(
        &self,
        queue: &str,
        receipt: ReceiptHandle,
        requeue: bool,
        delay: Option<Duration>,
    ) -> Result<(), BrokerError>;

    async fn queue_length(&self, queue: &str) -> Result<usize, BrokerError>;

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, BrokerError>;

    async fn health_check(&self) -> Result<bool, BrokerError>;
}
