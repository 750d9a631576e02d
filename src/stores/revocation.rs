//! # Revocation store (§4.5)
//!
//! A durable tombstone set plus a fan-out stream so every subscriber
//! (typically one per worker process) observes every revocation published
//! after it subscribed, independent of the others.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::RevocationError;
use crate::model::{RevocationEvent, RevokeOptions, Revocation};

#[async_trait]
pub trait RevocationStore: Send + Sync + std::fmt::Debug {
    async fn revoke(&self, task_id: Uuid, options: RevokeOptions, ttl: Option<Duration>) -> Result<(), RevocationError>;

    async fn revoke_batch(
        &self,
        task_ids: &[Uuid],
        options: RevokeOptions,
        ttl: Option<Duration>,
    ) -> Result<(), RevocationError> {
        for task_id in task_ids {
            self.revoke(*task_id, options, ttl).await?;
        }
        Ok(())
    }

    async fn is_revoked(&self, task_id: Uuid) -> Result<bool, RevocationError>;

    async fn list(&self) -> Result<Vec<Revocation>, RevocationError>;

    /// Drop tombstones older than `max_age` regardless of their own expiry.
    async fn cleanup(&self, max_age: Duration) -> Result<usize, RevocationError>;

    /// A new receiver on the shared fan-out channel. Only events published
    /// *after* this call returns are guaranteed to be observed.
    fn subscribe(&self) -> broadcast::Receiver<RevocationEvent>;
}

/// An in-memory [`RevocationStore`] backed by a `DashMap` tombstone set and a
/// `tokio::sync::broadcast` fan-out channel for [`RevocationStore::subscribe`].
#[derive(Debug)]
pub struct InMemoryRevocationStore {
    tombstones: DashMap<Uuid, Revocation>,
    events: broadcast::Sender<RevocationEvent>,
}

impl Default for InMemoryRevocationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRevocationStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            tombstones: DashMap::new(),
            events,
        }
    }
}

#[async_trait]
impl RevocationStore for InMemoryRevocationStore {
    async fn revoke(&self, task_id: Uuid, options: RevokeOptions, ttl: Option<Duration>) -> Result<(), RevocationError> {
        let revocation = Revocation::new(task_id, options, ttl);
        let event = RevocationEvent::from(&revocation);
        self.tombstones.insert(task_id, revocation);
        tracing::info!(%task_id, immediate = options.immediate, "revocation observed");
        // No subscribers is not an error: nothing has subscribed yet.
        let _ = self.events.send(event);
        Ok(())
    }

    async fn is_revoked(&self, task_id: Uuid) -> Result<bool, RevocationError> {
        let now = Utc::now();
        Ok(self.tombstones.get(&task_id).is_some_and(|r| r.is_live(now)))
    }

    async fn list(&self) -> Result<Vec<Revocation>, RevocationError> {
        Ok(self.tombstones.iter().map(|e| e.value().clone()).collect())
    }

    async fn cleanup(&self, max_age: Duration) -> Result<usize, RevocationError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let stale: Vec<Uuid> = self
            .tombstones
            .iter()
            .filter(|e| e.value().revoked_at < cutoff)
            .map(|e| *e.key())
            .collect();
        for task_id in &stale {
            self.tombstones.remove(task_id);
        }
        Ok(stale.len())
    }

    fn subscribe(&self) -> broadcast::Receiver<RevocationEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn revoke_is_observable_via_is_revoked() {
        let store = InMemoryRevocationStore::new();
        let task_id = Uuid::now_v7();
        assert!(!store.is_revoked(task_id).await.unwrap());
        store.revoke(task_id, RevokeOptions::default(), None).await.unwrap();
        assert!(store.is_revoked(task_id).await.unwrap());
    }

    #[tokio::test]
    async fn revocation_with_ttl_expires() {
        let store = InMemoryRevocationStore::new();
        let task_id = Uuid::now_v7();
        store
            .revoke(task_id, RevokeOptions::default(), Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!store.is_revoked(task_id).await.unwrap());
    }

    #[tokio::test]
    async fn each_subscriber_sees_every_event_published_after_it_joined() {
        let store = InMemoryRevocationStore::new();
        let mut sub1 = store.subscribe();
        store.revoke(Uuid::now_v7(), RevokeOptions::default(), None).await.unwrap();
        let mut sub2 = store.subscribe();
        store.revoke(Uuid::now_v7(), RevokeOptions::default(), None).await.unwrap();

        // sub1 joined before both revocations and must see both.
        assert!(sub1.recv().await.is_ok());
        assert!(sub1.recv().await.is_ok());
        // sub2 joined after the first and must see only the second.
        let second = sub2.recv().await.unwrap();
        assert!(sub2.try_recv().is_err());
        let _ = second;
    }

    #[tokio::test]
    async fn cleanup_drops_only_tombstones_older_than_max_age() {
        let store = InMemoryRevocationStore::new();
        store.revoke(Uuid::now_v7(), RevokeOptions::default(), None).await.unwrap();
        let removed = store.cleanup(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(removed, 0);
    }
}
