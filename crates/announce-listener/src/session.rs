//! Broker session: endpoints, socket creation and the live subscriber slot.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use url::Url;

use crate::Error;
use crate::config::ListenerConfig;
use crate::transport::{RequestSocket, SubscriberSocket, SubscriberWriter, Transport};

/// Owns the transport and at most one active subscriber.
///
/// The subscriber's read half is handed to the receive loop; the write half
/// stays here so control operations can register topics without touching the
/// read side.
pub struct Session {
    transport: Arc<dyn Transport>,
    control_endpoint: Url,
    pub_endpoint: Url,
    connect_timeout: Duration,
    request_timeout: Duration,
    subscriber: Mutex<Option<Box<dyn SubscriberWriter>>>,
    disposed: AtomicBool,
}

impl Session {
    pub fn new(config: &ListenerConfig, transport: Arc<dyn Transport>) -> Result<Self, Error> {
        Ok(Self {
            transport,
            control_endpoint: config.control_endpoint()?,
            pub_endpoint: config.pub_endpoint()?,
            connect_timeout: config.timing.connect_timeout,
            request_timeout: config.timing.request_timeout,
            subscriber: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn control_endpoint(&self) -> &Url {
        &self.control_endpoint
    }

    pub fn pub_endpoint(&self) -> &Url {
        &self.pub_endpoint
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    /// Connect a new subscriber to the publish endpoint.
    pub async fn create_subscriber_socket(&self) -> Result<SubscriberSocket, Error> {
        self.ensure_open()?;
        tokio::time::timeout(
            self.connect_timeout,
            self.transport.subscriber(&self.pub_endpoint),
        )
        .await
        .map_err(|_| {
            Error::Connect(format!(
                "{} timed out after {}ms",
                self.pub_endpoint,
                self.connect_timeout.as_millis()
            ))
        })?
    }

    /// Connect a request socket to the control endpoint.
    ///
    /// The caller must [`close`](RequestSocket::close) it after one exchange;
    /// prefer [`request`](Self::request), which does so on every path.
    pub async fn create_request_socket(&self) -> Result<Box<dyn RequestSocket>, Error> {
        self.ensure_open()?;
        tokio::time::timeout(
            self.connect_timeout,
            self.transport.request(&self.control_endpoint),
        )
        .await
        .map_err(|_| {
            Error::Connect(format!(
                "{} timed out after {}ms",
                self.control_endpoint,
                self.connect_timeout.as_millis()
            ))
        })?
    }

    /// Send `payload` and wait up to `timeout` for a single reply.
    ///
    /// A missing reply is [`Error::ReceiveTimeout`]. The socket is released
    /// whether or not the exchange succeeded.
    pub async fn request(&self, payload: &str, timeout: Duration) -> Result<String, Error> {
        let mut socket = self.create_request_socket().await?;
        let result = exchange(socket.as_mut(), payload, timeout).await;
        socket.close().await;
        result
    }

    /// Make `writer` the live subscriber, closing any previous one.
    pub async fn install_subscriber(&self, writer: Box<dyn SubscriberWriter>) {
        let previous = self.subscriber.lock().await.replace(writer);
        if let Some(mut previous) = previous {
            tracing::warn!("Replacing a subscriber that was never released");
            previous.close().await;
        }
    }

    /// Register `topic` on the live subscriber.
    ///
    /// The write is bounded by the request timeout, since the subscriber slot
    /// stays locked for its duration and teardown waits on that lock.
    pub async fn subscribe(&self, topic: &str) -> Result<(), Error> {
        let mut guard = self.subscriber.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::Subscribe("subscriber socket is not connected".to_string()))?;
        tokio::time::timeout(self.request_timeout, writer.subscribe(topic))
            .await
            .map_err(|_| {
                Error::Subscribe(format!(
                    "timed out after {}ms",
                    self.request_timeout.as_millis()
                ))
            })?
    }

    /// Close the live subscriber, if any. Returns whether one was released.
    pub async fn release_subscriber(&self) -> bool {
        let writer = self.subscriber.lock().await.take();
        match writer {
            Some(mut writer) => {
                writer.close().await;
                true
            }
            None => false,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Release any still-open subscriber and refuse new sockets.
    ///
    /// The receive loop must have exited before this is called.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.release_subscriber().await {
            tracing::debug!("Released subscriber on dispose");
        }
    }
}

async fn exchange(
    socket: &mut dyn RequestSocket,
    payload: &str,
    timeout: Duration,
) -> Result<String, Error> {
    socket.send(payload).await?;
    tokio::time::timeout(timeout, socket.recv())
        .await
        .map_err(|_| Error::ReceiveTimeout)?
}
