//! In-process fakes for sockets and backends

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::{Sink, Stream, StreamExt};
use relay_storage::{BackendError, LockBackend, PubSubBackend, Subscription};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::message::Message;
use crate::session::{Outcome, OutcomeSink};

/// Server end of an in-memory websocket
pub struct FakeSocket {
    inbound: UnboundedReceiver<Result<Message, io::Error>>,
    outbound: UnboundedSender<Message>,
}

/// Remote end of an in-memory websocket
pub struct FakePeer {
    tx: Option<UnboundedSender<Result<Message, io::Error>>>,
    rx: UnboundedReceiver<Message>,
}

pub fn fake_socket() -> (FakeSocket, FakePeer) {
    let (in_tx, in_rx) = unbounded();
    let (out_tx, out_rx) = unbounded();
    (
        FakeSocket {
            inbound: in_rx,
            outbound: out_tx,
        },
        FakePeer {
            tx: Some(in_tx),
            rx: out_rx,
        },
    )
}

fn broken_pipe<E>(_: E) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "peer gone")
}

impl Stream for FakeSocket {
    type Item = Result<Message, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inbound).poll_next(cx)
    }
}

impl Sink<Message> for FakeSocket {
    type Error = io::Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.outbound).poll_ready(cx).map_err(broken_pipe)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
        Pin::new(&mut self.outbound).start_send(item).map_err(broken_pipe)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.outbound).poll_flush(cx).map_err(broken_pipe)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.outbound).poll_close(cx).map_err(broken_pipe)
    }
}

impl FakePeer {
    /// Deliver a frame to the server side
    pub fn send(&self, message: Message) {
        if let Some(tx) = &self.tx {
            let _ = tx.unbounded_send(Ok(message));
        }
    }

    /// Hang up; the server read pump sees end of stream
    pub fn disconnect(&mut self) {
        self.tx.take();
    }

    /// Next frame written by the server, `None` once it closed the socket
    pub async fn next_frame(&mut self) -> Option<Message> {
        self.rx.next().await
    }
}

/// What a [`ScriptedLock`] answers to `acquire`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireScript {
    Grant,
    Deny,
    Fail,
}

/// Lock backend with canned answers and call counters
pub struct ScriptedLock {
    acquire: AcquireScript,
    pub renew_ok: AtomicBool,
    pub renew_fails: AtomicBool,
    pub release_fails: AtomicBool,
    pub acquires: AtomicUsize,
    pub renews: AtomicUsize,
    pub releases: AtomicUsize,
}

impl ScriptedLock {
    pub fn new(acquire: AcquireScript) -> Arc<Self> {
        Arc::new(Self {
            acquire,
            renew_ok: AtomicBool::new(true),
            renew_fails: AtomicBool::new(false),
            release_fails: AtomicBool::new(false),
            acquires: AtomicUsize::new(0),
            renews: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        })
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn renews(&self) -> usize {
        self.renews.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LockBackend for ScriptedLock {
    async fn acquire(&self, _key: &str, _token: &str, _ttl: Duration) -> Result<bool, BackendError> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        match self.acquire {
            AcquireScript::Grant => Ok(true),
            AcquireScript::Deny => Ok(false),
            AcquireScript::Fail => Err(BackendError::Backend("connection refused".to_string())),
        }
    }

    async fn renew(&self, _key: &str, _token: &str, _ttl: Duration) -> Result<bool, BackendError> {
        self.renews.fetch_add(1, Ordering::SeqCst);
        if self.renew_fails.load(Ordering::SeqCst) {
            return Err(BackendError::Backend("connection reset".to_string()));
        }
        Ok(self.renew_ok.load(Ordering::SeqCst))
    }

    async fn release(&self, _key: &str, _token: &str) -> Result<(), BackendError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        if self.release_fails.load(Ordering::SeqCst) {
            return Err(BackendError::Backend("connection reset".to_string()));
        }
        Ok(())
    }
}

/// Pub/sub backend whose subscribe always fails
pub struct RefusingPubSub;

#[async_trait]
impl PubSubBackend for RefusingPubSub {
    async fn subscribe(&self, _topic: &str) -> Result<Box<dyn Subscription>, BackendError> {
        Err(BackendError::Backend("connection refused".to_string()))
    }

    async fn publish(&self, _topic: &str, _payload: Bytes) -> Result<(), BackendError> {
        Err(BackendError::Backend("connection refused".to_string()))
    }
}

/// Pub/sub backend whose subscriptions fail once `sever` is called
#[derive(Default)]
pub struct SeveredPubSub {
    severed: CancellationToken,
    unsubscribes: Arc<AtomicUsize>,
}

impl SeveredPubSub {
    pub fn sever(&self) {
        self.severed.cancel();
    }

    pub fn unsubscribes(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }
}

struct SeveredSubscription {
    severed: CancellationToken,
    unsubscribes: Arc<AtomicUsize>,
}

#[async_trait]
impl Subscription for SeveredSubscription {
    async fn next_message(&mut self) -> Result<Option<Bytes>, BackendError> {
        self.severed.cancelled().await;
        Err(BackendError::Backend("connection reset".to_string()))
    }

    async fn unsubscribe(&mut self) -> Result<(), BackendError> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl PubSubBackend for SeveredPubSub {
    async fn subscribe(&self, _topic: &str) -> Result<Box<dyn Subscription>, BackendError> {
        Ok(Box::new(SeveredSubscription {
            severed: self.severed.clone(),
            unsubscribes: self.unsubscribes.clone(),
        }))
    }

    async fn publish(&self, _topic: &str, _payload: Bytes) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Outcome sink that keeps every report
#[derive(Clone, Default)]
pub struct RecordingSink {
    seen: Arc<Mutex<Vec<(String, Outcome)>>>,
}

impl RecordingSink {
    pub fn outcomes(&self) -> Vec<Outcome> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|(_, outcome)| *outcome)
            .collect()
    }

    pub fn for_key(&self, key: &str) -> Vec<Outcome> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, outcome)| *outcome)
            .collect()
    }
}

impl OutcomeSink for RecordingSink {
    fn report(&self, key: &str, outcome: Outcome) {
        self.seen.lock().unwrap().push((key.to_string(), outcome));
    }
}
