//! Duplex pub/sub channel.
//!
//! One subscription on a session key, pumped into a bounded receive queue,
//! plus a publish pump draining a bounded send queue. Publishing may target
//! any topic, not just the subscribed one.

use bytes::Bytes;
use relay_storage::{BackendError, PubSubBackend, Subscription};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::ChannelError;
use crate::message::Delivery;

struct Publish {
    topic: String,
    payload: Bytes,
}

/// Subscription on one topic with queued publishing
pub struct PubSubChannel {
    key: String,
    recv_rx: mpsc::Receiver<Bytes>,
    send_tx: Option<mpsc::Sender<Publish>>,
    cancel: CancellationToken,
    receive_pump: Option<JoinHandle<Result<(), BackendError>>>,
    publish_pump: Option<JoinHandle<()>>,
}

impl PubSubChannel {
    /// Subscribe to `key` and start both pumps
    pub async fn open(
        backend: Arc<dyn PubSubBackend>,
        key: &str,
        capacity: usize,
    ) -> Result<Self, BackendError> {
        let subscription = backend.subscribe(key).await?;
        debug!("Subscribed to {}", key);

        let (recv_tx, recv_rx) = mpsc::channel(capacity);
        let (send_tx, send_rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();

        let receive_pump = tokio::spawn(receive_pump(
            subscription,
            recv_tx,
            cancel.clone(),
            key.to_string(),
        ));
        let publish_pump = tokio::spawn(publish_pump(backend, send_rx, cancel.clone()));

        Ok(Self {
            key: key.to_string(),
            recv_rx,
            send_tx: Some(send_tx),
            cancel,
            receive_pump: Some(receive_pump),
            publish_pump: Some(publish_pump),
        })
    }

    /// Next published payload, or `Closed` once the subscription ended
    pub async fn recv(&mut self) -> Delivery<Bytes> {
        self.recv_rx.recv().await.into()
    }

    /// Queue a publish, waiting while the queue is full
    pub async fn send(&self, topic: &str, payload: Bytes) -> Result<(), ChannelError> {
        let tx = self.send_tx.as_ref().ok_or(ChannelError::Closed)?;
        if self.cancel.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        let publish = Publish {
            topic: topic.to_string(),
            payload,
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ChannelError::Closed),
            sent = tx.send(publish) => sent.map_err(|_| ChannelError::Closed),
        }
    }

    /// Flush queued publishes, unsubscribe and stop both pumps.
    ///
    /// Returns the unsubscribe error, if any. Later calls return `Ok(())`.
    pub async fn close(&mut self) -> Result<(), BackendError> {
        self.send_tx.take();
        if let Some(handle) = self.publish_pump.take() {
            if let Err(e) = handle.await {
                error!("Publish pump for {} failed: {}", self.key, e);
            }
        }

        self.cancel.cancel();
        let unsubscribed = match self.receive_pump.take() {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(BackendError::Backend(format!("receive pump failed: {}", e))),
            },
            None => Ok(()),
        };
        self.recv_rx.close();
        unsubscribed
    }
}

impl Drop for PubSubChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn receive_pump(
    mut subscription: Box<dyn Subscription>,
    recv_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    key: String,
) -> Result<(), BackendError> {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = subscription.next_message() => next,
        };

        match next {
            Ok(Some(payload)) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = recv_tx.send(payload) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Ok(None) => {
                debug!("Subscription to {} ended", key);
                break;
            }
            Err(e) => {
                warn!("Subscription to {} failed: {}", key, e);
                break;
            }
        }
    }

    drop(recv_tx);
    subscription.unsubscribe().await
}

async fn publish_pump(
    backend: Arc<dyn PubSubBackend>,
    mut send_rx: mpsc::Receiver<Publish>,
    cancel: CancellationToken,
) {
    loop {
        let publish = tokio::select! {
            _ = cancel.cancelled() => break,
            next = send_rx.recv() => match next {
                Some(publish) => publish,
                None => break,
            },
        };

        if let Err(e) = backend.publish(&publish.topic, publish.payload).await {
            warn!("Publish to {} failed: {}", publish.topic, e);
            cancel.cancel();
            break;
        }
    }
}
