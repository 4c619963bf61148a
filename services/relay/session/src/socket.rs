//! Duplex socket channel.
//!
//! Wraps one client connection in a pair of pumps: the read pump moves
//! inbound frames onto a bounded receive queue and enforces the idle
//! timeout, the write pump drains a bounded send queue with a per-write
//! deadline and pings the peer when the connection is otherwise quiet.
//! Pump failures are logged here; the only signal the owner sees is the
//! receive queue closing.

use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{check_period, nine_tenths, ChannelError, ConfigError, MAX_PERIOD, MIN_PERIOD};
use crate::message::{Delivery, Message, CLOSE_NORMAL};

/// Keepalive and queueing parameters for a socket channel
#[derive(Clone, Debug)]
pub struct SocketConfig {
    /// Close the connection after this long without any inbound frame
    pub idle_timeout: Duration,
    /// Ping the peer after this long without an outbound frame
    pub ping_period: Duration,
    /// Deadline for a single frame write
    pub write_wait: Duration,
    /// Capacity of the receive and send queues
    pub queue_capacity: usize,
}

impl SocketConfig {
    /// Config for an idle timeout, pinging at 9/10 of it
    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            ping_period: nine_tenths(idle_timeout),
            ..Self::default()
        }
    }

    /// Reject settings the pumps cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_period("idle_timeout", self.idle_timeout)?;
        check_period("ping_period", self.ping_period)?;
        check_period("write_wait", self.write_wait)?;
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroCapacity { name: "socket queue_capacity" });
        }
        Ok(())
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5),
            ping_period: Duration::from_millis(4500),
            write_wait: Duration::from_secs(1),
            queue_capacity: 256,
        }
    }
}

/// One client connection driven by a read pump and a write pump
pub struct SocketChannel {
    label: String,
    write_wait: Duration,
    recv_rx: mpsc::Receiver<Message>,
    send_tx: Option<mpsc::Sender<Message>>,
    cancel: CancellationToken,
    read_pump: Option<JoinHandle<()>>,
    write_pump: Option<JoinHandle<()>>,
}

impl SocketChannel {
    /// Start both pumps over `transport`. `label` only shows up in logs.
    pub fn open<T, E>(transport: T, config: SocketConfig, label: impl Into<String>) -> Self
    where
        T: Stream<Item = Result<Message, E>> + Sink<Message, Error = E> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let label = label.into();
        let (writer, reader) = transport.split();
        let (recv_tx, recv_rx) = mpsc::channel(config.queue_capacity);
        let (send_tx, send_rx) = mpsc::channel(config.queue_capacity);
        let cancel = CancellationToken::new();

        let read_pump = tokio::spawn(read_pump(
            reader,
            recv_tx,
            config.idle_timeout,
            cancel.clone(),
            label.clone(),
        ));
        let write_pump = tokio::spawn(write_pump(
            writer,
            send_rx,
            config.clone(),
            cancel.clone(),
            label.clone(),
        ));

        Self {
            label,
            write_wait: config.write_wait,
            recv_rx,
            send_tx: Some(send_tx),
            cancel,
            read_pump: Some(read_pump),
            write_pump: Some(write_pump),
        }
    }

    /// Next inbound frame, or `Closed` once the peer is gone. Cancel safe.
    pub async fn recv(&mut self) -> Delivery<Message> {
        self.recv_rx.recv().await.into()
    }

    /// Queue a frame for the write pump, waiting while the queue is full
    pub async fn send(&self, message: Message) -> Result<(), ChannelError> {
        let tx = self.send_tx.as_ref().ok_or(ChannelError::Closed)?;
        if self.cancel.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ChannelError::Closed),
            sent = tx.send(message) => sent.map_err(|_| ChannelError::Closed),
        }
    }

    /// Whether either pump has terminated or `close` was called
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.send_tx.is_none()
    }

    /// Flush queued frames, send a close frame and stop both pumps.
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn close(&mut self) {
        // Dropping the sender lets the write pump drain and say goodbye
        self.send_tx.take();

        if let Some(mut handle) = self.write_pump.take() {
            let bound = self.write_wait * 2;
            match tokio::time::timeout(bound, &mut handle).await {
                Ok(joined) => log_join(&self.label, "write", joined),
                Err(_) => {
                    debug!("Write pump for {} did not drain within {:?}", self.label, bound);
                    self.cancel.cancel();
                    log_join(&self.label, "write", handle.await);
                }
            }
        }

        self.cancel.cancel();
        if let Some(handle) = self.read_pump.take() {
            log_join(&self.label, "read", handle.await);
        }
        self.recv_rx.close();
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn log_join(label: &str, pump: &str, joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!("Socket {} pump for {} failed: {}", pump, label, e);
    }
}

async fn read_pump<R, E>(
    mut reader: R,
    recv_tx: mpsc::Sender<Message>,
    idle_timeout: Duration,
    cancel: CancellationToken,
    label: String,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(idle_timeout, reader.next()) => next,
        };

        let message = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!("Socket read error from {}: {}", label, e);
                break;
            }
            Ok(None) => {
                debug!("Socket {} closed by peer", label);
                break;
            }
            Err(_) => {
                warn!("Idle timeout reached for {}; closing socket", label);
                break;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = recv_tx.send(message) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    // Takes the write pump down with us; recv_tx drops here
    cancel.cancel();
}

async fn write_pump<W, E>(
    mut writer: W,
    mut send_rx: mpsc::Receiver<Message>,
    config: SocketConfig,
    cancel: CancellationToken,
    label: String,
) where
    W: Sink<Message, Error = E> + Unpin,
    E: fmt::Display,
{
    let period = config.ping_period.clamp(MIN_PERIOD, MAX_PERIOD);
    let mut ping = tokio::time::interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut close_sent = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            next = send_rx.recv() => {
                let Some(message) = next else {
                    if !close_sent {
                        if let Err(e) = write_frame(&mut writer, Message::close(CLOSE_NORMAL), config.write_wait).await {
                            debug!("Failed to send close frame to {}: {}", label, e);
                        }
                    }
                    break;
                };

                // At most one close frame per connection
                let closing = message.is_close();
                if closing && close_sent {
                    continue;
                }

                if let Err(e) = write_frame(&mut writer, message, config.write_wait).await {
                    debug!("Socket write error to {}: {}", label, e);
                    break;
                }
                close_sent |= closing;
                ping.reset();
            }

            _ = ping.tick() => {
                if close_sent {
                    continue;
                }
                if let Err(e) = write_frame(&mut writer, Message::ping(), config.write_wait).await {
                    debug!("Failed to send PING to {}: {}", label, e);
                    break;
                }
            }
        }
    }

    match tokio::time::timeout(config.write_wait, writer.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Failed to close socket to {}: {}", label, e),
        Err(_) => debug!("Closing socket to {} exceeded {:?}", label, config.write_wait),
    }
    cancel.cancel();
}

async fn write_frame<W, E>(writer: &mut W, message: Message, write_wait: Duration) -> Result<(), String>
where
    W: Sink<Message, Error = E> + Unpin,
    E: fmt::Display,
{
    match tokio::time::timeout(write_wait, writer.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("write deadline of {:?} exceeded", write_wait)),
    }
}
