//! In-memory backends for development and testing

use crate::{BackendError, LockBackend, PubSubBackend, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default per-topic buffer for the in-memory pub/sub
pub const TOPIC_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct LockEntry {
    token: String,
    expires_at: Instant,
}

/// In-memory lock with expiring, token-owned entries
pub struct MemoryLockBackend {
    /// key -> current owner
    entries: Arc<DashMap<String, LockEntry>>,
}

impl MemoryLockBackend {
    /// Create a new in-memory lock backend
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }
}

impl Default for MemoryLockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, BackendError> {
        let now = Instant::now();
        let fresh = LockEntry {
            token: token.to_string(),
            expires_at: now + ttl,
        };

        let granted = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().expires_at <= now || held.get().token == token {
                    held.insert(fresh);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                true
            }
        };

        debug!("lock acquire key={} granted={}", key, granted);
        Ok(granted)
    }

    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, BackendError> {
        let now = Instant::now();
        let renewed = match self.entries.get_mut(key) {
            Some(mut held) if held.token == token && held.expires_at > now => {
                held.expires_at = now + ttl;
                true
            }
            _ => false,
        };

        debug!("lock renew key={} renewed={}", key, renewed);
        Ok(renewed)
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), BackendError> {
        let removed = self.entries.remove_if(key, |_, held| held.token == token);
        debug!("lock release key={} removed={}", key, removed.is_some());
        Ok(())
    }
}

/// Lock backend that grants every request.
///
/// Used when locking is disabled in configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLockBackend;

#[async_trait]
impl LockBackend for NoopLockBackend {
    async fn acquire(&self, _key: &str, _token: &str, _ttl: Duration) -> Result<bool, BackendError> {
        Ok(true)
    }

    async fn renew(&self, _key: &str, _token: &str, _ttl: Duration) -> Result<bool, BackendError> {
        Ok(true)
    }

    async fn release(&self, _key: &str, _token: &str) -> Result<(), BackendError> {
        Ok(())
    }
}

/// In-memory pub/sub built on broadcast channels.
///
/// Each topic buffers `capacity` payloads per subscriber. A subscriber that
/// falls further behind than that has lost messages, so its subscription
/// fails instead of silently skipping ahead.
pub struct MemoryPubSub {
    /// topic -> fan-out sender
    topics: Arc<DashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
}

impl MemoryPubSub {
    /// Create a new in-memory pub/sub with [`TOPIC_CAPACITY`] per topic
    pub fn new() -> Self {
        Self::with_capacity(TOPIC_CAPACITY)
    }

    /// Create a new in-memory pub/sub buffering `capacity` payloads per topic
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of live subscribers on a topic
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubBackend for MemoryPubSub {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, BackendError> {
        let rx = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        debug!("subscribed to topic={}", topic);
        Ok(Box::new(MemorySubscription {
            topic: topic.to_string(),
            rx: Some(rx),
            topics: self.topics.clone(),
        }))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BackendError> {
        // No subscribers is not an error, same as a real broker
        if let Some(tx) = self.topics.get(topic) {
            let _ = tx.send(payload);
        }
        Ok(())
    }
}

struct MemorySubscription {
    topic: String,
    rx: Option<broadcast::Receiver<Bytes>>,
    topics: Arc<DashMap<String, broadcast::Sender<Bytes>>>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self) -> Result<Option<Bytes>, BackendError> {
        let Some(rx) = self.rx.as_mut() else {
            return Ok(None);
        };

        match rx.recv().await {
            Ok(payload) => Ok(Some(payload)),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Subscriber on topic {} lagged by {} messages", self.topic, n);
                Err(BackendError::Backend(format!(
                    "subscriber on {} dropped {} message(s)",
                    self.topic, n
                )))
            }
            Err(broadcast::error::RecvError::Closed) => Ok(None),
        }
    }

    async fn unsubscribe(&mut self) -> Result<(), BackendError> {
        if self.rx.take().is_some() {
            self.topics
                .remove_if(&self.topic, |_, tx| tx.receiver_count() == 0);
            debug!("unsubscribed from topic={}", self.topic);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_lock_exclusion() {
        let locks = MemoryLockBackend::new();
        let ttl = Duration::from_secs(10);

        assert!(locks.acquire("room-42", "a", ttl).await.unwrap());
        assert!(!locks.acquire("room-42", "b", ttl).await.unwrap());

        // Release by a non-owner leaves the lock in place
        locks.release("room-42", "b").await.unwrap();
        assert!(!locks.acquire("room-42", "b", ttl).await.unwrap());

        locks.release("room-42", "a").await.unwrap();
        assert!(locks.acquire("room-42", "b", ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_lock_expiry_and_renew() {
        let locks = MemoryLockBackend::new();
        let ttl = Duration::from_secs(10);

        assert!(locks.acquire("room-42", "a", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(locks.renew("room-42", "a", ttl).await.unwrap());

        // Still held 9s after the renewal
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(!locks.acquire("room-42", "b", ttl).await.unwrap());

        // Expired: another owner takes it and the old owner can't renew
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(locks.acquire("room-42", "b", ttl).await.unwrap());
        assert!(!locks.renew("room-42", "a", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let locks = MemoryLockBackend::new();
        locks.release("never-held", "a").await.unwrap();

        assert!(locks.acquire("k", "a", Duration::from_secs(1)).await.unwrap());
        locks.release("k", "a").await.unwrap();
        locks.release("k", "a").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_pubsub_fan_out_in_order() {
        let pubsub = MemoryPubSub::new();
        let mut sub = pubsub.subscribe("room-42").await.unwrap();

        for payload in ["m1", "m2", "m3"] {
            pubsub.publish("room-42", Bytes::from(payload)).await.unwrap();
        }
        // Other topics are not delivered
        pubsub.publish("room-43", Bytes::from("other")).await.unwrap();

        assert_eq!(sub.next_message().await.unwrap().unwrap(), "m1");
        assert_eq!(sub.next_message().await.unwrap().unwrap(), "m2");
        assert_eq!(sub.next_message().await.unwrap().unwrap(), "m3");
    }

    #[tokio::test]
    async fn test_memory_unsubscribe() {
        let pubsub = MemoryPubSub::new();
        let mut sub = pubsub.subscribe("room-42").await.unwrap();
        assert_eq!(pubsub.subscriber_count("room-42"), 1);

        sub.unsubscribe().await.unwrap();
        sub.unsubscribe().await.unwrap();
        assert_eq!(pubsub.subscriber_count("room-42"), 0);
        assert!(sub.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_fails() {
        let pubsub = MemoryPubSub::with_capacity(2);
        let mut sub = pubsub.subscribe("room-42").await.unwrap();

        for payload in ["p1", "p2", "p3"] {
            pubsub.publish("room-42", Bytes::from(payload)).await.unwrap();
        }
        assert!(sub.next_message().await.is_err());
        sub.unsubscribe().await.unwrap();
        assert_eq!(pubsub.subscriber_count("room-42"), 0);
    }
}
