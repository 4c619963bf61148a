//! Process-wide accounting of in-flight sessions.
//!
//! Every session holds a [`SessionGuard`] from the moment it starts locking
//! until all of its resources are released. Shutdown waits on
//! [`LifecycleTracker::wait_timeout`] so the process never blocks forever on
//! a session that fails to drain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::DrainTimeout;

#[derive(Debug, Default)]
struct TrackerInner {
    active: AtomicUsize,
    drained: Notify,
}

/// Counter of in-flight sessions with a bounded drain wait
#[derive(Debug, Clone, Default)]
pub struct LifecycleTracker {
    inner: Arc<TrackerInner>,
}

impl LifecycleTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session; the count drops when the guard is dropped
    pub fn begin(&self) -> SessionGuard {
        let active = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("session begin, active={}", active);
        SessionGuard {
            inner: self.inner.clone(),
        }
    }

    /// Number of sessions not yet closed
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Wait until no session is in flight, up to `bound`
    pub async fn wait_timeout(&self, bound: Duration) -> Result<(), DrainTimeout> {
        let drained = async {
            loop {
                let notified = self.inner.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if self.active() == 0 {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(bound, drained)
            .await
            .map_err(|_| DrainTimeout {
                remaining: self.active(),
                waited: bound,
            })
    }
}

/// Keeps a session counted; dropping it decrements exactly once
#[derive(Debug)]
#[must_use = "the session is untracked as soon as the guard is dropped"]
pub struct SessionGuard {
    inner: Arc<TrackerInner>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let remaining = self.inner.active.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!("session end, active={}", remaining);
        if remaining == 0 {
            self.inner.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_with_nothing_in_flight() {
        let tracker = LifecycleTracker::new();
        tracker.wait_timeout(Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_guards_count_exactly_once() {
        let tracker = LifecycleTracker::new();
        let a = tracker.begin();
        let b = tracker.begin();
        assert_eq!(tracker.active(), 2);

        drop(a);
        assert_eq!(tracker.active(), 1);
        drop(b);
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_on_stuck_session() {
        let tracker = LifecycleTracker::new();
        let _stuck = tracker.begin();

        let err = tracker
            .wait_timeout(Duration::from_secs(10))
            .await
            .unwrap_err();
        assert_eq!(err.remaining, 1);
        assert_eq!(err.waited, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_wakes_when_last_session_ends() {
        let tracker = LifecycleTracker::new();
        let guard = tracker.begin();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            drop(guard);
        });

        tracker.wait_timeout(Duration::from_secs(10)).await.unwrap();
        assert_eq!(tracker.active(), 0);
    }
}
