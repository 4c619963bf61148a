//! Session orchestration.
//!
//! A [`Session`] owns one lock handle, one pub/sub channel and one socket
//! channel for a single session key and walks them through
//! `Locking -> Active -> Draining -> Closed`:
//!
//! - **Locking** takes the lock and subscribes to the key
//!   ([`Session::establish`]); the caller still holds the socket upgrade at
//!   this point so it can turn a conflict into a rejection.
//! - **Active** bridges socket frames to pub/sub and back, renews the lock at
//!   9/10 of its TTL and watches the process shutdown token
//!   ([`Session::run`]).
//! - **Draining** closes the socket, then the subscription, then releases the
//!   lock. Errors here are logged and never stop the teardown.
//! - **Closed** reports the outcome and drops the lifecycle guard.

use futures::{Future, Sink, Stream};
use relay_storage::Backends;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{check_period, nine_tenths, ConfigError};
use crate::lifecycle::{LifecycleTracker, SessionGuard};
use crate::lock::DistributedLock;
use crate::message::{Delivery, Message, CLOSE_GOING_AWAY};
use crate::pubsub::PubSubChannel;
use crate::socket::{SocketChannel, SocketConfig};

/// Configuration for relay sessions
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Lock grant duration; renewed every 9/10 of it
    pub lock_ttl: Duration,
    /// Capacity of the pub/sub queues
    pub queue_capacity: usize,
    /// Publish socket frames to `key + suffix` instead of the key itself
    pub reply_suffix: Option<String>,
    /// Socket keepalive and queueing
    pub socket: SocketConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(10),
            queue_capacity: 256,
            reply_suffix: None,
            socket: SocketConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Lock renewal interval
    pub fn renew_period(&self) -> Duration {
        nine_tenths(self.lock_ttl)
    }

    /// Reject settings a session cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_period("lock_ttl", self.lock_ttl)?;
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity { name: "queue_capacity" });
        }
        self.socket.validate()
    }

    /// Topic that socket frames for `key` are published to
    pub fn publish_topic(&self, key: &str) -> String {
        match &self.reply_suffix {
            Some(suffix) => format!("{}{}", key, suffix),
            None => key.to_string(),
        }
    }
}

/// Session lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Taking the lock and subscribing
    Locking,
    /// Bridging socket and pub/sub
    Active,
    /// Releasing owned resources
    Draining,
    /// Terminal
    Closed,
}

/// How a session ended (or that it went live)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Session reached the active state
    Active,
    /// Key locked by another session
    Conflict,
    /// Backend or upgrade failure
    InternalError,
    /// Socket peer went away
    PeerDisconnected,
    /// Lock renewal failed
    LockLost,
    /// Process shutdown
    Shutdown,
}

impl Outcome {
    /// Stable name used in logs and reports
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Active => "active",
            Outcome::Conflict => "conflict",
            Outcome::InternalError => "internal-error",
            Outcome::PeerDisconnected => "peer-disconnected",
            Outcome::LockLost => "lock-lost",
            Outcome::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an active session started draining
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DrainCause {
    PeerDisconnected,
    SubscriptionClosed,
    LockLost,
    Shutdown,
}

impl From<DrainCause> for Outcome {
    fn from(cause: DrainCause) -> Self {
        match cause {
            DrainCause::PeerDisconnected => Outcome::PeerDisconnected,
            // The subscription only ends on its own when the backend fails
            DrainCause::SubscriptionClosed => Outcome::InternalError,
            DrainCause::LockLost => Outcome::LockLost,
            DrainCause::Shutdown => Outcome::Shutdown,
        }
    }
}

/// Receiver of session outcomes
pub trait OutcomeSink: Send + Sync {
    /// Called once when a session goes active and once when it ends
    fn report(&self, key: &str, outcome: Outcome);
}

impl<F> OutcomeSink for F
where
    F: Fn(&str, Outcome) + Send + Sync,
{
    fn report(&self, key: &str, outcome: Outcome) {
        self(key, outcome)
    }
}

/// Outcome sink that writes to the log
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl OutcomeSink for LogSink {
    fn report(&self, key: &str, outcome: Outcome) {
        match outcome {
            Outcome::Active => info!("Session {} active", key),
            Outcome::Conflict => info!("Session {} rejected: key is locked", key),
            Outcome::InternalError => error!("Session {} failed", key),
            other => info!("Session {} closed: {}", key, other),
        }
    }
}

/// Per-process dependencies shared by every session
#[derive(Clone)]
pub struct SessionContext {
    /// Lock and pub/sub backends
    pub backends: Backends,
    /// In-flight session accounting
    pub tracker: LifecycleTracker,
    /// Process shutdown signal
    pub shutdown: CancellationToken,
    /// Outcome receiver
    pub sink: Arc<dyn OutcomeSink>,
    /// Session configuration
    pub config: SessionConfig,
}

impl SessionContext {
    /// Context with a fresh tracker and shutdown token, logging outcomes
    pub fn new(backends: Backends, config: SessionConfig) -> Self {
        Self {
            backends,
            tracker: LifecycleTracker::new(),
            shutdown: CancellationToken::new(),
            sink: Arc::new(LogSink),
            config,
        }
    }

    /// Report outcomes to `sink` instead of the log
    pub fn with_sink(mut self, sink: impl OutcomeSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Observe an existing shutdown token
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// One relay session for one key
pub struct Session {
    ctx: SessionContext,
    key: String,
    state: SessionState,
    lock: DistributedLock,
    pubsub: Option<PubSubChannel>,
    guard: Option<SessionGuard>,
}

impl Session {
    /// Take the lock for `key` and subscribe to it.
    ///
    /// On failure the outcome has already been reported and every resource
    /// released; the caller only has to reject the client.
    pub async fn establish(ctx: SessionContext, key: impl Into<String>) -> Result<Session, Outcome> {
        let key = key.into();
        if let Err(e) = ctx.config.validate() {
            error!("Refusing session {}: {}", key, e);
            ctx.sink.report(&key, Outcome::InternalError);
            return Err(Outcome::InternalError);
        }
        let guard = ctx.tracker.begin();
        let mut lock = DistributedLock::new(ctx.backends.locks.clone(), key.clone(), ctx.config.lock_ttl);

        debug!("Locking session {}", key);
        match lock.acquire().await {
            Ok(true) => {}
            Ok(false) => {
                ctx.sink.report(&key, Outcome::Conflict);
                return Err(Outcome::Conflict);
            }
            Err(e) => {
                error!("Lock acquire for {} failed: {}", key, e);
                ctx.sink.report(&key, Outcome::InternalError);
                return Err(Outcome::InternalError);
            }
        }

        let pubsub = match PubSubChannel::open(
            ctx.backends.pubsub.clone(),
            &key,
            ctx.config.queue_capacity,
        )
        .await
        {
            Ok(pubsub) => pubsub,
            Err(e) => {
                error!("Subscribe to {} failed: {}", key, e);
                if let Err(e) = lock.release().await {
                    warn!("Lock release for {} failed: {}", key, e);
                }
                ctx.sink.report(&key, Outcome::InternalError);
                return Err(Outcome::InternalError);
            }
        };

        Ok(Session {
            ctx,
            key,
            state: SessionState::Locking,
            lock,
            pubsub: Some(pubsub),
            guard: Some(guard),
        })
    }

    /// Session key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Wait for the socket upgrade, bridge until a drain cause fires, then
    /// tear everything down. Returns the reported outcome.
    pub async fn run<U, T, E, UE>(mut self, upgrade: U) -> Outcome
    where
        U: Future<Output = Result<T, UE>>,
        UE: fmt::Display,
        T: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let shutdown = self.ctx.shutdown.clone();
        let upgraded = tokio::select! {
            upgraded = upgrade => upgraded,
            _ = shutdown.cancelled() => {
                debug!("Shutdown before socket upgrade for {}", self.key);
                return self.teardown(Outcome::Shutdown).await;
            }
        };
        let transport = match upgraded {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Socket upgrade for {} failed: {}", self.key, e);
                return self.teardown(Outcome::InternalError).await;
            }
        };

        let mut socket = SocketChannel::open(transport, self.ctx.config.socket.clone(), self.key.clone());
        self.state = SessionState::Active;
        info!("Starting session for {}", self.key);
        self.ctx.sink.report(&self.key, Outcome::Active);

        let cause = match self.pubsub.as_mut() {
            Some(pubsub) => {
                let topic = self.ctx.config.publish_topic(&self.key);
                bridge(&mut socket, pubsub, &self.lock, &topic, &shutdown).await
            }
            None => DrainCause::SubscriptionClosed,
        };

        debug!("Draining session {}: {:?}", self.key, cause);
        self.state = SessionState::Draining;
        socket.close().await;
        self.teardown(cause.into()).await
    }

    /// [`establish`](Self::establish) then [`run`](Self::run)
    pub async fn serve<U, T, E, UE>(ctx: SessionContext, key: impl Into<String>, upgrade: U) -> Outcome
    where
        U: Future<Output = Result<T, UE>>,
        UE: fmt::Display,
        T: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        match Session::establish(ctx, key).await {
            Ok(session) => session.run(upgrade).await,
            Err(outcome) => outcome,
        }
    }

    /// Close the subscription, release the lock, report and untrack
    async fn teardown(&mut self, outcome: Outcome) -> Outcome {
        self.state = SessionState::Draining;
        if let Some(mut pubsub) = self.pubsub.take() {
            if let Err(e) = pubsub.close().await {
                warn!("Unsubscribe from {} failed: {}", self.key, e);
            }
        }
        if let Err(e) = self.lock.release().await {
            warn!("Lock release for {} failed: {}", self.key, e);
        }

        self.state = SessionState::Closed;
        self.ctx.sink.report(&self.key, outcome);
        self.guard.take();
        outcome
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        let key = self.key.clone();
        let mut lock = self.lock.handoff();
        let pubsub = self.pubsub.take();
        let guard = self.guard.take();
        let sink = self.ctx.sink.clone();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Session {} dropped outside the runtime; lock left to expire", key);
            return;
        };
        runtime.spawn(async move {
            debug!("Cleaning up abandoned session {}", key);
            if let Some(mut pubsub) = pubsub {
                if let Err(e) = pubsub.close().await {
                    warn!("Unsubscribe from {} failed: {}", key, e);
                }
            }
            if let Err(e) = lock.release().await {
                warn!("Lock release for {} failed: {}", key, e);
            }
            sink.report(&key, Outcome::InternalError);
            drop(guard);
        });
    }
}

/// Event loop for an active session. No branch is preferred over another.
async fn bridge(
    socket: &mut SocketChannel,
    pubsub: &mut PubSubChannel,
    lock: &DistributedLock,
    topic: &str,
    shutdown: &CancellationToken,
) -> DrainCause {
    let period = lock.renew_period();
    let mut renew = tokio::time::interval_at(Instant::now() + period, period);
    renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Delivery::Message(message) => {
                    if !message.is_data() {
                        continue;
                    }
                    if pubsub.send(topic, message.payload).await.is_err() {
                        return DrainCause::SubscriptionClosed;
                    }
                }
                Delivery::Closed => return DrainCause::PeerDisconnected,
            },

            published = pubsub.recv() => match published {
                Delivery::Message(payload) => {
                    if socket.send(Message::text(payload)).await.is_err() {
                        return DrainCause::PeerDisconnected;
                    }
                }
                Delivery::Closed => return DrainCause::SubscriptionClosed,
            },

            _ = renew.tick() => match lock.renew().await {
                Ok(true) => debug!("Renewed lock on {}", lock.key()),
                Ok(false) => {
                    warn!("Lock on {} was lost", lock.key());
                    return DrainCause::LockLost;
                }
                Err(e) => {
                    warn!("Lock renewal for {} failed: {}", lock.key(), e);
                    return DrainCause::LockLost;
                }
            },

            _ = shutdown.cancelled() => {
                if socket.send(Message::close(CLOSE_GOING_AWAY)).await.is_err() {
                    debug!("Socket for {} already closed at shutdown", lock.key());
                }
                return DrainCause::Shutdown;
            }
        }
    }
}
