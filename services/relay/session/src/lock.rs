//! Session-scoped handle on a distributed lock.

use relay_storage::{BackendError, LockBackend};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::nine_tenths;

/// Exclusive, expiring ownership of one session key.
///
/// Each handle carries a fresh owner token, so a handle never renews or
/// releases a grant that belongs to someone else. `release` reaches the
/// backend at most once, and only after a successful `acquire`.
pub struct DistributedLock {
    backend: Arc<dyn LockBackend>,
    key: String,
    token: String,
    ttl: Duration,
    acquired: bool,
}

impl DistributedLock {
    /// New, unacquired handle for `key`
    pub fn new(backend: Arc<dyn LockBackend>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            backend,
            key: key.into(),
            token: Uuid::new_v4().to_string(),
            ttl,
            acquired: false,
        }
    }

    /// Locked key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Grant duration
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Renewal interval, 9/10 of the TTL
    pub fn renew_period(&self) -> Duration {
        nine_tenths(self.ttl)
    }

    /// Single attempt to take the key; `Ok(false)` when another owner holds it
    pub async fn acquire(&mut self) -> Result<bool, BackendError> {
        let granted = self.backend.acquire(&self.key, &self.token, self.ttl).await?;
        self.acquired |= granted;
        Ok(granted)
    }

    /// Extend the grant by one TTL; `Ok(false)` when the lock was lost
    pub async fn renew(&self) -> Result<bool, BackendError> {
        if !self.acquired {
            return Ok(false);
        }
        self.backend.renew(&self.key, &self.token, self.ttl).await
    }

    /// Give the key up. No-op on a handle that holds nothing.
    pub async fn release(&mut self) -> Result<(), BackendError> {
        if !std::mem::take(&mut self.acquired) {
            return Ok(());
        }
        debug!("Releasing lock on {}", self.key);
        self.backend.release(&self.key, &self.token).await
    }

    /// Move the grant into a new handle, leaving this one empty
    pub fn handoff(&mut self) -> DistributedLock {
        DistributedLock {
            backend: self.backend.clone(),
            key: self.key.clone(),
            token: self.token.clone(),
            ttl: self.ttl,
            acquired: std::mem::take(&mut self.acquired),
        }
    }
}
