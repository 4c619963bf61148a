//! Relay load generator.
//!
//! Opens many long-lived websocket sessions against a relay listener and
//! keeps them open until SIGINT/SIGTERM. More connections can be added at
//! runtime with `GET /inc?count=N` on the control listener. On shutdown every
//! connection sends one going-away close frame and waits for the listener to
//! hang up.

mod template;

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use redb_relay::{component_info, component_warn, logging};
use relay_session::{
    Delivery, LifecycleTracker, Message, SocketChannel, SocketConfig, TungsteniteTransport,
    CLOSE_GOING_AWAY,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use template::{origin_for, UrlTemplate};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Relay load generator
#[derive(Parser, Debug)]
#[command(name = "relay-bench", version, about = "Open many relay sessions and hold them")]
struct Args {
    /// Endpoint template, e.g. ws://127.0.0.1:8080/{index}-{random:32}
    url: UrlTemplate,

    /// Origin header; derived from the endpoint when empty
    #[arg(long)]
    origin: Option<String>,

    /// Connections to open at startup
    #[arg(long, default_value_t = 1)]
    connections: usize,

    /// Tasks opening connections in parallel
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Control listener address
    #[arg(long, default_value = "0.0.0.0:8081")]
    control: SocketAddr,

    /// Client-side idle timeout
    #[arg(long, default_value = "5s")]
    idle_timeout: humantime::Duration,

    /// How long shutdown waits for connections to close
    #[arg(long, default_value = "60s")]
    drain_timeout: humantime::Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Everything a connection task needs
struct Bench {
    template: UrlTemplate,
    origin: Option<String>,
    concurrency: usize,
    socket: SocketConfig,
    tracker: LifecycleTracker,
    quitting: CancellationToken,
}

impl Bench {
    /// Split `count` connections over the configured number of tasks
    fn create_connections(self: &Arc<Self>, count: usize) {
        for (start, len) in batches(count, self.concurrency) {
            let bench = self.clone();
            tokio::spawn(async move {
                for index in start..start + len {
                    if bench.quitting.is_cancelled() {
                        return;
                    }
                    if let Err(e) = bench.connect_and_hold(index).await {
                        warn!("Connection {} failed: {:#}", index, e);
                    }
                }
            });
        }
    }

    async fn connect_and_hold(&self, index: usize) -> Result<()> {
        let endpoint = self.template.render(index, &mut rand::thread_rng());
        let origin = self.origin.clone().unwrap_or_else(|| origin_for(&endpoint));

        let mut request = endpoint.as_str().into_client_request()?;
        request.headers_mut().insert(ORIGIN, HeaderValue::from_str(&origin)?);

        info!("Trying to connect to: {}", endpoint);
        let (stream, _) = tokio_tungstenite::connect_async(request).await?;
        let guard = self.tracker.begin();
        let channel = SocketChannel::open(
            TungsteniteTransport::new(stream),
            self.socket.clone(),
            endpoint.clone(),
        );
        info!("Connected to: {}", endpoint);

        let quitting = self.quitting.clone();
        tokio::spawn(async move {
            hold(channel, quitting).await;
            info!("Disconnected from: {}", endpoint);
            drop(guard);
        });
        Ok(())
    }
}

/// Discard inbound frames until the peer leaves or we are told to quit
async fn hold(mut channel: SocketChannel, quitting: CancellationToken) {
    loop {
        tokio::select! {
            delivered = channel.recv() => {
                if delivered == Delivery::Closed {
                    info!("websocket channel closed");
                    break;
                }
            }
            _ = quitting.cancelled() => {
                if let Err(e) = channel.send(Message::close(CLOSE_GOING_AWAY)).await {
                    warn!("Failed to send close frame: {}", e);
                }
                // The listener answers with its own close and hangs up
                while let Delivery::Message(_) = channel.recv().await {}
                break;
            }
        }
    }
    channel.close().await;
}

/// `(first index, count)` per task; the last task takes the remainder
fn batches(connections: usize, concurrency: usize) -> Vec<(usize, usize)> {
    let concurrency = concurrency.max(1);
    let per_task = connections / concurrency;
    (0..concurrency)
        .map(|i| {
            let len = if i == concurrency - 1 {
                connections - i * per_task
            } else {
                per_task
            };
            (i * per_task, len)
        })
        .filter(|(_, len)| *len > 0)
        .collect()
}

#[derive(Debug, Deserialize)]
struct IncParams {
    count: Option<String>,
}

fn parse_count(raw: Option<&str>) -> Option<usize> {
    raw?.trim().parse().ok()
}

async fn increase(State(requests): State<mpsc::Sender<usize>>, Query(params): Query<IncParams>) -> StatusCode {
    let Some(count) = parse_count(params.count.as_deref()) else {
        return StatusCode::BAD_REQUEST;
    };
    component_info!("control", "Adding {} connection(s)", count);
    match requests.send(count).await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn control_router(requests: mpsc::Sender<usize>) -> Router {
    Router::new()
        .route("/favicon.ico", get(|| async { StatusCode::NOT_FOUND }))
        .route("/inc", get(increase))
        .with_state(requests)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM signal"),
                    _ = sigint.recv() => info!("Received SIGINT signal"),
                }
            }
            (Err(e), _) | (_, Err(e)) => error!("Failed to install signal handlers: {}", e),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to wait for Ctrl-C: {}", e);
        }
    }

    component_info!("control", "Stopping control listener");
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init("bench", &args.log_level, &["relay_bench", "redb_relay", "relay_session"])?;

    let socket = SocketConfig::with_idle_timeout(args.idle_timeout.into());
    socket.validate()?;

    let bench = Arc::new(Bench {
        template: args.url.clone(),
        origin: args.origin.clone().filter(|o| !o.is_empty()),
        concurrency: args.concurrency,
        socket,
        tracker: LifecycleTracker::new(),
        quitting: CancellationToken::new(),
    });

    let (requests_tx, mut requests_rx) = mpsc::channel::<usize>(16);
    let creator = bench.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = creator.quitting.cancelled() => return,
                next = requests_rx.recv() => match next {
                    Some(count) => creator.create_connections(count),
                    None => return,
                },
            }
        }
    });

    info!("Benchmarker started");
    if requests_tx.send(args.connections).await.is_err() {
        anyhow::bail!("connection creator stopped before startup");
    }

    let listener = tokio::net::TcpListener::bind(args.control).await?;
    component_info!("control", "Control listener on {}", args.control);
    axum::serve(listener, control_router(requests_tx))
        .with_graceful_shutdown(wait_for_signal())
        .await?;

    bench.quitting.cancel();
    let drain: Duration = args.drain_timeout.into();
    info!("Closing {} connection(s), waiting up to {:?}", bench.tracker.active(), drain);
    if let Err(e) = bench.tracker.wait_timeout(drain).await {
        component_warn!("control", "Shutdown incomplete: {}", e);
        return Err(e.into());
    }

    info!("Benchmarker stopped");
    Ok(())
}
