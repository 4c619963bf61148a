//! Lock and pub/sub backends for relay sessions.
//!
//! This crate provides the backing-store layer for relay sessions: an
//! expiring, token-owned lock per session key and a topic based
//! publish/subscribe transport. Backends are pluggable (in-memory, no-op
//! locking, Redis) and selected from configuration.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Backend errors
#[derive(Error, Debug)]
pub enum BackendError {
    /// Redis transport or protocol error
    #[cfg(feature = "redis-backend")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    /// Subscription or connection already closed
    #[error("Backend closed")]
    Closed,
    /// Invalid operation or configuration
    #[error("Invalid operation: {0}")]
    Invalid(String),
    /// Backend-specific error
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Expiring mutual-exclusion primitive keyed by session key.
///
/// `token` identifies the owner. `renew` and `release` only touch the key
/// while the stored token still matches.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Single attempt to take `key` for `ttl`; `Ok(false)` means held elsewhere
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, BackendError>;

    /// Extend ownership of `key` by `ttl`; `Ok(false)` means the lock was lost
    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, BackendError>;

    /// Drop ownership of `key` if still owned by `token`
    async fn release(&self, key: &str, token: &str) -> Result<(), BackendError>;
}

/// Topic based publish/subscribe transport
#[async_trait]
pub trait PubSubBackend: Send + Sync {
    /// Subscribe to a single topic
    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, BackendError>;

    /// Publish a payload to a topic
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), BackendError>;
}

/// A live subscription on one topic.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next published payload; `Ok(None)` once the subscription ended.
    ///
    /// Must be cancel safe.
    async fn next_message(&mut self) -> Result<Option<Bytes>, BackendError>;

    /// Stop receiving; safe to call more than once
    async fn unsubscribe(&mut self) -> Result<(), BackendError>;
}

/// Backend configuration
#[derive(Clone, Debug)]
pub enum BackendMode {
    /// In-memory lock and pub/sub (single process, dev/tests)
    InMemory,
    /// Redis for both lock and pub/sub
    Redis {
        /// Redis connection URL
        url: String,
    },
}

impl Default for BackendMode {
    fn default() -> Self {
        BackendMode::InMemory
    }
}

// Re-export backend implementations
pub use backend::mem::{MemoryLockBackend, MemoryPubSub, NoopLockBackend, TOPIC_CAPACITY};
#[cfg(feature = "redis-backend")]
pub use backend::redis::{RedisLockBackend, RedisPubSub};

/// Combined backend handles shared by every session of a process
#[derive(Clone)]
pub struct Backends {
    /// Lock backend
    pub locks: Arc<dyn LockBackend>,
    /// Pub/sub backend
    pub pubsub: Arc<dyn PubSubBackend>,
}

impl Backends {
    /// Create backends from configuration.
    ///
    /// With `locking` disabled every lock request is granted.
    pub async fn from_mode(mode: BackendMode, locking: bool) -> Result<Self, BackendError> {
        let backends = match mode {
            BackendMode::InMemory => Backends {
                locks: Arc::new(MemoryLockBackend::new()),
                pubsub: Arc::new(MemoryPubSub::new()),
            },
            #[cfg(feature = "redis-backend")]
            BackendMode::Redis { url } => {
                let client = redis::Client::open(url.as_str())?;
                let manager = redis::aio::ConnectionManager::new(client.clone()).await?;
                let mut ping = manager.clone();
                let _: String = redis::cmd("PING").query_async(&mut ping).await?;
                tracing::info!("Connected to redis at {}", url);
                Backends {
                    locks: Arc::new(RedisLockBackend::new(manager.clone())),
                    pubsub: Arc::new(RedisPubSub::new(client, manager)),
                }
            }
            #[cfg(not(feature = "redis-backend"))]
            BackendMode::Redis { .. } => {
                return Err(BackendError::Invalid(
                    "Redis requested but not compiled with redis-backend".to_string(),
                ));
            }
        };

        if locking {
            Ok(backends)
        } else {
            Ok(Backends {
                locks: Arc::new(NoopLockBackend),
                pubsub: backends.pubsub,
            })
        }
    }
}
