//! Messaging transport seam.
//!
//! The listener only needs two socket shapes from the underlying messaging
//! layer: a subscriber (split into a read half owned by the receive loop and
//! a write half used to register topics) and a one-shot request/reply socket.
//! Timeouts are applied by callers.

use async_trait::async_trait;
use url::Url;

use crate::Error;

/// Factory for broker sockets.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connect a subscriber to the publish endpoint.
    async fn subscriber(&self, endpoint: &Url) -> Result<SubscriberSocket, Error>;

    /// Connect a request socket to the control endpoint.
    async fn request(&self, endpoint: &Url) -> Result<Box<dyn RequestSocket>, Error>;
}

/// Both halves of a connected subscriber.
pub struct SubscriberSocket {
    pub reader: Box<dyn SubscriberReader>,
    pub writer: Box<dyn SubscriberWriter>,
}

/// Read half of a subscriber. Owned by the receive loop only.
#[async_trait]
pub trait SubscriberReader: Send {
    /// Wait for the next frame. Pending until one arrives or the socket fails.
    async fn recv(&mut self) -> Result<String, Error>;
}

/// Write half of a subscriber.
#[async_trait]
pub trait SubscriberWriter: Send {
    /// Register interest in `topic`.
    async fn subscribe(&mut self, topic: &str) -> Result<(), Error>;

    /// Release the socket. Called exactly once.
    async fn close(&mut self);
}

/// A request/reply socket used for a single exchange.
#[async_trait]
pub trait RequestSocket: Send {
    async fn send(&mut self, payload: &str) -> Result<(), Error>;

    /// Wait for the reply. Pending until one arrives or the socket fails.
    async fn recv(&mut self) -> Result<String, Error>;

    async fn close(&mut self);
}
