//! Redis lock and pub/sub backend

use crate::{BackendError, LockBackend, PubSubBackend, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::debug;

/// Extend the key only while it still holds our token
const RENEW_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Delete the key only while it still holds our token
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// Redis lock: `SET NX PX` plus compare-and-set scripts
pub struct RedisLockBackend {
    conn: ConnectionManager,
    renew: redis::Script,
    release: redis::Script,
}

impl RedisLockBackend {
    /// Create a lock backend over a shared connection manager
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            renew: redis::Script::new(RENEW_SCRIPT),
            release: redis::Script::new(RELEASE_SCRIPT),
        }
    }
}

#[async_trait]
impl LockBackend for RedisLockBackend {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;

        debug!("redis lock acquire key={} granted={}", key, reply.is_some());
        Ok(reply.is_some())
    }

    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let extended: i64 = self
            .renew
            .key(key)
            .arg(token)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        debug!("redis lock renew key={} renewed={}", key, extended == 1);
        Ok(extended == 1)
    }

    async fn release(&self, key: &str, token: &str) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;

        debug!("redis lock release key={} deleted={}", key, deleted);
        Ok(())
    }
}

/// Redis pub/sub: one dedicated connection per subscription, shared
/// connection manager for publishing
pub struct RedisPubSub {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisPubSub {
    /// Create a pub/sub backend
    pub fn new(client: redis::Client, conn: ConnectionManager) -> Self {
        Self { client, conn }
    }
}

#[async_trait]
impl PubSubBackend for RedisPubSub {
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, BackendError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;

        debug!("redis subscribed to topic={}", topic);
        Ok(Box::new(RedisSubscription {
            topic: topic.to_string(),
            pubsub: Some(pubsub),
        }))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let _receivers: i64 = redis::cmd("PUBLISH")
            .arg(topic)
            .arg(&payload[..])
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

struct RedisSubscription {
    topic: String,
    pubsub: Option<redis::aio::PubSub>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_message(&mut self) -> Result<Option<Bytes>, BackendError> {
        let Some(pubsub) = self.pubsub.as_mut() else {
            return Ok(None);
        };

        match pubsub.on_message().next().await {
            Some(msg) => Ok(Some(Bytes::copy_from_slice(msg.get_payload_bytes()))),
            None => Ok(None),
        }
    }

    async fn unsubscribe(&mut self) -> Result<(), BackendError> {
        if let Some(mut pubsub) = self.pubsub.take() {
            pubsub.unsubscribe(&self.topic).await?;
            debug!("redis unsubscribed from topic={}", self.topic);
        }
        Ok(())
    }
}
