//! Lock-guarded websocket to pub/sub relay sessions.
//!
//! A relay session pairs one client websocket with one pub/sub topic named
//! by the session key. A distributed, renewable lock makes sure only one live
//! session holds a given key, and a process-wide shutdown token drains every
//! session together.
//!
//! ## Features
//!
//! - **Socket channel**: read/write pumps with idle timeout and pings
//! - **Pub/sub channel**: subscription and publish pumps over a pluggable backend
//! - **Distributed lock**: token-owned grant renewed at 9/10 of its TTL
//! - **Session orchestration**: locking, bridging and ordered teardown
//! - **Lifecycle tracking**: bounded drain wait at process shutdown
//!
//! ## Example
//!
//! ```rust,no_run
//! use relay_session::{Outcome, Session, SessionConfig, SessionContext, TungsteniteTransport};
//! use relay_storage::{BackendMode, Backends};
//! use std::time::Duration;
//!
//! # async fn example(
//! #     stream: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
//! # ) -> anyhow::Result<()> {
//! let backends = Backends::from_mode(BackendMode::InMemory, true).await?;
//! let ctx = SessionContext::new(backends, SessionConfig::default());
//!
//! let upgrade = async move { Ok::<_, std::io::Error>(TungsteniteTransport::new(stream)) };
//! let outcome = Session::serve(ctx.clone(), "room-42", upgrade).await;
//! assert_ne!(outcome, Outcome::Active);
//!
//! ctx.shutdown.cancel();
//! ctx.tracker.wait_timeout(Duration::from_secs(10)).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod lifecycle;
pub mod lock;
pub mod message;
pub mod pubsub;
pub mod session;
pub mod socket;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export main types
pub use error::{check_period, ChannelError, ConfigError, DrainTimeout, MAX_PERIOD, MIN_PERIOD};
pub use lifecycle::{LifecycleTracker, SessionGuard};
pub use lock::DistributedLock;
pub use message::{Delivery, Message, MessageKind, CLOSE_GOING_AWAY, CLOSE_NORMAL};
pub use pubsub::PubSubChannel;
pub use session::{
    LogSink, Outcome, OutcomeSink, Session, SessionConfig, SessionContext, SessionState,
};
pub use socket::{SocketChannel, SocketConfig};
pub use transport::{AxumTransport, TungsteniteTransport, WsFrame, WsTransport};
