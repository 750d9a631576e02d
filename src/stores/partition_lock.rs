//! # Partition lock store (§4.4)
//!
//! A per-key mutual-exclusion record used by the executor to serialize
//! handling of messages sharing a `partition_key`. Expired entries are
//! reclaimed lazily on access and by a periodic sweep.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::LockError;
use crate::model::PartitionLock;

#[async_trait]
pub trait PartitionLockStore: Send + Sync + std::fmt::Debug {
    /// Succeeds iff `key` is absent, already held by `task_id` (idempotent
    /// re-acquire, which also extends the TTL), or the existing lock has expired.
    async fn try_acquire(&self, key: &str, task_id: Uuid, ttl: Duration) -> Result<bool, LockError>;

    /// Succeeds only when `task_id` is the current holder.
    async fn release(&self, key: &str, task_id: Uuid) -> Result<bool, LockError>;

    async fn extend(&self, key: &str, task_id: Uuid, ttl: Duration) -> Result<bool, LockError>;

    async fn is_locked(&self, key: &str) -> Result<bool, LockError>;

    async fn holder(&self, key: &str) -> Result<Option<Uuid>, LockError>;

    /// Drop every expired entry. Called by the periodic sweeper; also safe
    /// to call ad hoc (e.g. from a health endpoint or test).
    async fn sweep_expired(&self) -> Result<usize, LockError>;
}

/// An in-memory [`PartitionLockStore`].
#[derive(Debug, Default)]
pub struct InMemoryPartitionLockStore {
    locks: DashMap<String, PartitionLock>,
}

impl InMemoryPartitionLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a background task that calls [`Self::sweep_expired`] on `interval`.
    /// Runs until the returned handle is dropped or aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = this.sweep_expired().await {
                    tracing::warn!(%err, "partition lock sweep failed");
                }
            }
        })
    }
}

#[async_trait]
impl PartitionLockStore for InMemoryPartitionLockStore {
    async fn try_acquire(&self, key: &str, task_id: Uuid, ttl: Duration) -> Result<bool, LockError> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        let acquired = match self.locks.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(PartitionLock {
                    partition_key: key.to_string(),
                    holder_task_id: task_id,
                    expires_at,
                });
                true
            }
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let existing = entry.get();
                if existing.holder_task_id == task_id || existing.is_expired(now) {
                    entry.insert(PartitionLock {
                        partition_key: key.to_string(),
                        holder_task_id: task_id,
                        expires_at,
                    });
                    true
                } else {
                    false
                }
            }
        };
        Ok(acquired)
    }

    async fn release(&self, key: &str, task_id: Uuid) -> Result<bool, LockError> {
        let released = match self.locks.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) if entry.get().holder_task_id == task_id => {
                entry.remove();
                true
            }
            _ => false,
        };
        Ok(released)
    }

    async fn extend(&self, key: &str, task_id: Uuid, ttl: Duration) -> Result<bool, LockError> {
        let now = Utc::now();
        let extended = match self.locks.get_mut(key) {
            Some(mut lock) if lock.holder_task_id == task_id => {
                lock.expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
                true
            }
            _ => false,
        };
        Ok(extended)
    }

    async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        let now = Utc::now();
        Ok(self.locks.get(key).is_some_and(|lock| !lock.is_expired(now)))
    }

    async fn holder(&self, key: &str) -> Result<Option<Uuid>, LockError> {
        let now = Utc::now();
        Ok(self
            .locks
            .get(key)
            .filter(|lock| !lock.is_expired(now))
            .map(|lock| lock.holder_task_id))
    }

    async fn sweep_expired(&self) -> Result<usize, LockError> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .locks
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        for key in &expired {
            self.locks.remove(key);
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_acquire_succeeds_and_second_holder_is_rejected() {
        let store = InMemoryPartitionLockStore::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        assert!(store.try_acquire("k", a, Duration::from_secs(30)).await.unwrap());
        assert!(!store.try_acquire("k", b, Duration::from_secs(30)).await.unwrap());
        assert_eq!(store.holder("k").await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn reacquire_by_same_holder_is_idempotent() {
        let store = InMemoryPartitionLockStore::new();
        let a = Uuid::now_v7();
        assert!(store.try_acquire("k", a, Duration::from_secs(30)).await.unwrap());
        assert!(store.try_acquire("k", a, Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn release_only_succeeds_for_the_current_holder() {
        let store = InMemoryPartitionLockStore::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        store.try_acquire("k", a, Duration::from_secs(30)).await.unwrap();
        assert!(!store.release("k", b).await.unwrap());
        assert!(store.release("k", a).await.unwrap());
        assert!(!store.is_locked("k").await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_can_be_taken_by_a_new_holder() {
        let store = InMemoryPartitionLockStore::new();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        store.try_acquire("k", a, Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.try_acquire("k", b, Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_entries() {
        let store = InMemoryPartitionLockStore::new();
        store
            .try_acquire("expired", Uuid::now_v7(), Duration::from_millis(1))
            .await
            .unwrap();
        store
            .try_acquire("live", Uuid::now_v7(), Duration::from_secs(30))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let swept = store.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);
        assert!(store.is_locked("live").await.unwrap());
    }
}
