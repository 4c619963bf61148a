//! Relay listener binary.
//!
//! Accepts websocket clients on `/{key}`, locks the key, and bridges the
//! client to the pub/sub topic of the same name until the client leaves, the
//! lock is lost or the process is asked to stop.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use redb_relay::config::{BackendKind, RelayConfig};
use redb_relay::{component_info, component_warn, logging};
use relay_session::{AxumTransport, Outcome, Session, SessionContext};
use relay_storage::Backends;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

/// Websocket to pub/sub relay guarded by a per-key distributed lock
#[derive(Parser, Debug)]
#[command(name = "redb-relay", version, about = "Websocket to pub/sub relay with per-key locking")]
struct Args {
    /// Listen address [default: 0.0.0.0:8080]
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Backend: memory or redis [default: memory]
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Redis address [default: 127.0.0.1:6379]
    #[arg(long)]
    redis_addr: Option<String>,

    /// Accept sessions without taking a lock on the key
    #[arg(long)]
    no_lock: bool,

    /// Lock TTL, renewed every 9/10 of it [default: 10s]
    #[arg(long)]
    lock_ttl: Option<humantime::Duration>,

    /// Close clients silent for this long [default: 5s]
    #[arg(long)]
    idle_timeout: Option<humantime::Duration>,

    /// How long shutdown waits for sessions to drain [default: 10s]
    #[arg(long)]
    drain_timeout: Option<humantime::Duration>,

    /// Largest accepted websocket message in bytes [default: 512]
    #[arg(long)]
    max_message_size: Option<usize>,

    /// Publish client frames to `<key><suffix>` instead of `<key>`
    #[arg(long)]
    reply_suffix: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

impl Args {
    /// Explicit flags win over file and environment
    fn apply(&self, config: &mut RelayConfig) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(addr) = &self.redis_addr {
            config.redis_addr = addr.clone();
        }
        if self.no_lock {
            config.locking = false;
        }
        if let Some(ttl) = self.lock_ttl {
            config.lock_ttl = ttl.into();
        }
        if let Some(idle) = self.idle_timeout {
            config.idle_timeout = idle.into();
        }
        if let Some(drain) = self.drain_timeout {
            config.drain_timeout = drain.into();
        }
        if let Some(size) = self.max_message_size {
            config.max_message_size = size;
        }
        if let Some(suffix) = &self.reply_suffix {
            config.reply_suffix = Some(suffix.clone());
        }
    }
}

#[derive(Clone)]
struct AppState {
    ctx: SessionContext,
    max_message_size: usize,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/favicon.ico", get(|| async { StatusCode::NOT_FOUND }))
        .route("/", get(relay_generated_key))
        .route("/{key}", get(relay_key))
        .with_state(state)
}

async fn relay_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    relay(state, key, ws).await
}

async fn relay_generated_key(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    relay(state, Uuid::new_v4().to_string(), ws).await
}

/// Lock first, upgrade second: a busy key is refused before the handshake
async fn relay(state: AppState, key: String, ws: WebSocketUpgrade) -> Response {
    let session = match Session::establish(state.ctx.clone(), key).await {
        Ok(session) => session,
        Err(Outcome::Conflict) => return (StatusCode::FORBIDDEN, "key is locked").into_response(),
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let (upgraded_tx, upgraded_rx) = oneshot::channel();
    let key = session.key().to_string();
    let response = ws
        .max_message_size(state.max_message_size)
        .on_failed_upgrade(move |e| component_warn!("http", "Upgrade for {} failed: {}", key, e))
        .on_upgrade(move |socket| async move {
            if upgraded_tx.send(socket).is_err() {
                component_warn!("http", "Session ended before its socket was upgraded, dropping it");
            }
        });

    tokio::spawn(session.run(async move { upgraded_rx.await.map(AxumTransport::new) }));
    response
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM signal, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT signal, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to wait for Ctrl-C: {}", e);
            return;
        }
        info!("Received Ctrl-C, shutting down");
    }

    shutdown.cancel();
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(
        "relay",
        &args.log_level,
        &["redb_relay", "relay_session", "relay_storage"],
    )?;

    info!("Starting reDB Relay Service v{}", env!("CARGO_PKG_VERSION"));

    let mut config = RelayConfig::load_from_file(&args.config)?;
    args.apply(&mut config);
    config.validate()?;
    info!(
        "Final relay configuration: listen={}, backend={:?}, locking={}, lock_ttl={:?}, idle_timeout={:?}",
        config.listen, config.backend, config.locking, config.lock_ttl, config.idle_timeout
    );

    let backends = Backends::from_mode(config.backend_mode(), config.locking).await?;
    let shutdown = CancellationToken::new();
    let ctx = SessionContext::new(backends, config.session_config()).with_shutdown(shutdown.clone());

    let app = router(AppState {
        ctx: ctx.clone(),
        max_message_size: config.max_message_size,
    });

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    component_info!("http", "Listening on {}", config.listen);

    tokio::spawn(wait_for_signal(shutdown.clone()));
    let stopped = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { stopped.cancelled().await })
        .await?;

    info!(
        "Waiting up to {:?} for {} session(s) to drain",
        config.drain_timeout,
        ctx.tracker.active()
    );
    if let Err(e) = ctx.tracker.wait_timeout(config.drain_timeout).await {
        error!("Shutdown incomplete: {}", e);
        return Err(e.into());
    }

    info!("reDB Relay Service stopped");
    Ok(())
}
