//! Websocket transports for relay sessions.
//!
//! Both the server side (axum upgrades) and the client side
//! (tokio-tungstenite streams) are adapted to a single
//! `Stream<Item = Result<Message, E>> + Sink<Message>` shape that
//! [`SocketChannel`](crate::socket::SocketChannel) drives.

use bytes::Bytes;
use futures::{ready, Sink, Stream};
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::message::{Message, MessageKind};

use axum::extract::ws as axum_ws;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WireMessage;

/// Conversion between a websocket library frame and [`Message`]
pub trait WsFrame: Sized {
    /// Convert an inbound frame; `None` for frames with no relay meaning
    fn into_message(self) -> Option<Message>;

    /// Convert an outbound message
    fn from_message(message: Message) -> Self;
}

fn reason_text(payload: &Bytes) -> String {
    String::from_utf8_lossy(payload).into_owned()
}

impl WsFrame for axum_ws::Message {
    fn into_message(self) -> Option<Message> {
        let message = match self {
            axum_ws::Message::Text(text) => {
                Message::text(Bytes::copy_from_slice(text.as_str().as_bytes()))
            }
            axum_ws::Message::Binary(data) => Message::binary(data),
            axum_ws::Message::Ping(data) => Message {
                kind: MessageKind::Ping,
                payload: data,
            },
            axum_ws::Message::Pong(data) => Message {
                kind: MessageKind::Pong,
                payload: data,
            },
            axum_ws::Message::Close(frame) => match frame {
                Some(frame) => Message {
                    kind: MessageKind::Close(Some(frame.code)),
                    payload: Bytes::copy_from_slice(frame.reason.as_str().as_bytes()),
                },
                None => Message {
                    kind: MessageKind::Close(None),
                    payload: Bytes::new(),
                },
            },
        };
        Some(message)
    }

    fn from_message(message: Message) -> Self {
        match message.kind {
            MessageKind::Text => match String::from_utf8(message.payload.to_vec()) {
                Ok(text) => axum_ws::Message::Text(text.into()),
                Err(e) => axum_ws::Message::Binary(Bytes::from(e.into_bytes())),
            },
            MessageKind::Binary => axum_ws::Message::Binary(message.payload),
            MessageKind::Ping => axum_ws::Message::Ping(message.payload),
            MessageKind::Pong => axum_ws::Message::Pong(message.payload),
            MessageKind::Close(code) => {
                axum_ws::Message::Close(code.map(|code| axum_ws::CloseFrame {
                    code,
                    reason: reason_text(&message.payload).into(),
                }))
            }
        }
    }
}

impl WsFrame for WireMessage {
    fn into_message(self) -> Option<Message> {
        match self {
            WireMessage::Text(text) => Some(Message::text(Bytes::copy_from_slice(
                text.as_str().as_bytes(),
            ))),
            WireMessage::Binary(data) => Some(Message::binary(data)),
            WireMessage::Ping(data) => Some(Message {
                kind: MessageKind::Ping,
                payload: data,
            }),
            WireMessage::Pong(data) => Some(Message {
                kind: MessageKind::Pong,
                payload: data,
            }),
            WireMessage::Close(frame) => Some(match frame {
                Some(frame) => Message {
                    kind: MessageKind::Close(Some(u16::from(frame.code))),
                    payload: Bytes::copy_from_slice(frame.reason.as_str().as_bytes()),
                },
                None => Message {
                    kind: MessageKind::Close(None),
                    payload: Bytes::new(),
                },
            }),
            // Raw frames only show up when writing, never when reading
            WireMessage::Frame(_) => None,
        }
    }

    fn from_message(message: Message) -> Self {
        match message.kind {
            MessageKind::Text => match String::from_utf8(message.payload.to_vec()) {
                Ok(text) => WireMessage::Text(text.into()),
                Err(e) => WireMessage::Binary(Bytes::from(e.into_bytes())),
            },
            MessageKind::Binary => WireMessage::Binary(message.payload),
            MessageKind::Ping => WireMessage::Ping(message.payload),
            MessageKind::Pong => WireMessage::Pong(message.payload),
            MessageKind::Close(code) => WireMessage::Close(code.map(|code| CloseFrame {
                code: CloseCode::from(code),
                reason: reason_text(&message.payload).into(),
            })),
        }
    }
}

/// Websocket stream adapted to [`Message`] frames
pub struct WsTransport<S, F> {
    inner: S,
    _frame: PhantomData<fn() -> F>,
}

impl<S, F> WsTransport<S, F> {
    /// Wrap a websocket stream
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            _frame: PhantomData,
        }
    }

    /// Unwrap the underlying stream
    pub fn into_inner(self) -> S {
        self.inner
    }
}

/// Server-side transport over an upgraded axum socket
pub type AxumTransport = WsTransport<axum_ws::WebSocket, axum_ws::Message>;

/// Client-side transport over a tokio-tungstenite stream
pub type TungsteniteTransport<S> =
    WsTransport<tokio_tungstenite::WebSocketStream<S>, WireMessage>;

impl<S, F, E> Stream for WsTransport<S, F>
where
    S: Stream<Item = Result<F, E>> + Unpin,
    F: WsFrame,
{
    type Item = Result<Message, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(frame)) => {
                    if let Some(message) = frame.into_message() {
                        return Poll::Ready(Some(Ok(message)));
                    }
                }
                Some(Err(e)) => return Poll::Ready(Some(Err(e))),
                None => return Poll::Ready(None),
            }
        }
    }
}

impl<S, F> Sink<Message> for WsTransport<S, F>
where
    S: Sink<F> + Unpin,
    F: WsFrame,
{
    type Error = S::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
        Pin::new(&mut self.get_mut().inner).start_send(F::from_message(item))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_close(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CLOSE_GOING_AWAY;
    use futures::{SinkExt, StreamExt};

    #[test]
    fn test_tungstenite_close_code_survives_conversion() {
        let wire = WireMessage::from_message(Message::close(CLOSE_GOING_AWAY));
        match &wire {
            WireMessage::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Away),
            other => panic!("expected close frame, got {:?}", other),
        }

        let back = wire.into_message().unwrap();
        assert_eq!(back.kind, MessageKind::Close(Some(CLOSE_GOING_AWAY)));
    }

    #[test]
    fn test_axum_text_conversion() {
        let frame = axum_ws::Message::from_message(Message::text("{\"m1\"}"));
        assert!(matches!(&frame, axum_ws::Message::Text(t) if t.as_str() == "{\"m1\"}"));
        assert_eq!(frame.into_message().unwrap(), Message::text("{\"m1\"}"));
    }

    #[test]
    fn test_invalid_utf8_text_goes_out_as_binary() {
        let frame = WireMessage::from_message(Message::text(vec![0xffu8, 0xfe]));
        assert!(matches!(frame, WireMessage::Binary(_)));
    }

    #[tokio::test]
    async fn test_transport_maps_both_directions() {
        let (in_tx, in_rx) = futures::channel::mpsc::unbounded::<Result<WireMessage, ()>>();
        let (out_tx, mut out_rx) = futures::channel::mpsc::unbounded::<WireMessage>();

        let mut inbound = WsTransport::<_, WireMessage>::new(in_rx);
        in_tx
            .unbounded_send(Ok(WireMessage::Text("m1".to_string().into())))
            .unwrap();
        in_tx.unbounded_send(Ok(WireMessage::Ping(Bytes::new()))).unwrap();
        drop(in_tx);

        assert_eq!(inbound.next().await.unwrap().unwrap(), Message::text("m1"));
        assert_eq!(inbound.next().await.unwrap().unwrap(), Message::ping());
        assert!(inbound.next().await.is_none());

        let mut outbound = WsTransport::<_, WireMessage>::new(out_tx);
        outbound.send(Message::binary(vec![1u8, 2])).await.unwrap();
        match out_rx.next().await {
            Some(WireMessage::Binary(b)) => assert_eq!(b, Bytes::from_static(&[1, 2])),
            other => panic!("expected binary frame, got {:?}", other),
        }
    }
}
