//! Public types for the announce-listener crate.

use std::fmt;

use tokio_tungstenite::tungstenite;

/// A topic/message pair carried over the broker.
///
/// Both fields are non-empty; use [`Announcement::new`] to construct one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Announcement {
    topic: String,
    message: String,
}

impl Announcement {
    /// Build an announcement. Returns `None` if either part is empty.
    pub fn new(topic: impl Into<String>, message: impl Into<String>) -> Option<Self> {
        let topic = topic.into();
        let message = message.into();
        if topic.is_empty() || message.is_empty() {
            return None;
        }
        Some(Self { topic, message })
    }

    /// Topic (folder identifier) the announcement belongs to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Payload (revision identifier).
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Lifecycle state of a listener connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

/// Why a connection moved to [`ConnectionState::Disconnected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Connect failed, the heartbeat went unanswered, or a control operation failed.
    TimeOut,
    /// The wall clock jumped past the expected heartbeat cadence.
    SystemSleep,
    /// The caller stopped the listener.
    Requested,
    /// Any other failure.
    Error,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TimeOut => "timeout",
            Self::SystemSleep => "system sleep",
            Self::Requested => "requested",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Events emitted through a [`ChannelSink`](crate::ChannelSink).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The subscriber is connected and listening.
    Connected,
    /// The connection ended. Call [`Listener::connect`](crate::Listener::connect) to retry.
    Disconnected {
        reason: DisconnectReason,
        message: String,
    },
    /// An announcement arrived on a subscribed topic.
    Announcement(Announcement),
}

/// Errors produced by this crate.
///
/// Inside a running listener every error is converted into a disconnect;
/// only configuration errors reach the caller directly.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("receive timed out")]
    ReceiveTimeout,

    #[error("ping timeout")]
    PingTimeout,

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("announce failed: {0}")]
    Announce(String),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("connection closed")]
    Closed,

    #[error("session disposed")]
    Disposed,
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::InvalidAddress(e.to_string())
    }
}
