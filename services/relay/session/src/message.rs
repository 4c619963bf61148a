//! Frame model shared by the socket and pub/sub sides of a session.
//!
//! A [`Message`] is the transport-neutral view of one websocket frame. Data
//! frames (`Text`/`Binary`) are bridged to pub/sub; control frames drive
//! keepalive and close handling.

use bytes::Bytes;

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint going away (server shutdown)
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Frame kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// UTF-8 data frame
    Text,
    /// Binary data frame
    Binary,
    /// Keepalive probe
    Ping,
    /// Keepalive acknowledgment
    Pong,
    /// Close frame with optional status code
    Close(Option<u16>),
}

/// One frame moving through a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Frame kind
    pub kind: MessageKind,
    /// Frame payload (close reason for close frames)
    pub payload: Bytes,
}

impl Message {
    /// Text frame
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Text,
            payload: payload.into(),
        }
    }

    /// Binary frame
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            kind: MessageKind::Binary,
            payload: payload.into(),
        }
    }

    /// Empty ping
    pub fn ping() -> Self {
        Self {
            kind: MessageKind::Ping,
            payload: Bytes::new(),
        }
    }

    /// Empty pong
    pub fn pong() -> Self {
        Self {
            kind: MessageKind::Pong,
            payload: Bytes::new(),
        }
    }

    /// Close frame with a status code and no reason
    pub fn close(code: u16) -> Self {
        Self {
            kind: MessageKind::Close(Some(code)),
            payload: Bytes::new(),
        }
    }

    /// Whether this is a data frame that gets bridged
    pub fn is_data(&self) -> bool {
        matches!(self.kind, MessageKind::Text | MessageKind::Binary)
    }

    /// Whether this is a close frame
    pub fn is_close(&self) -> bool {
        matches!(self.kind, MessageKind::Close(_))
    }
}

/// Outcome of waiting on a pump's receive queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery<T> {
    /// Next inbound item
    Message(T),
    /// Queue closed; the pump terminated and nothing more will arrive
    Closed,
}

impl<T> From<Option<T>> for Delivery<T> {
    fn from(item: Option<T>) -> Self {
        match item {
            Some(item) => Delivery::Message(item),
            None => Delivery::Closed,
        }
    }
}
