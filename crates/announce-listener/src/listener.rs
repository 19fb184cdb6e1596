//! Public entry point: [`Listener`].

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::config::ListenerConfig;
use crate::connection::{Shared, lock, run_receive_loop};
use crate::liveness::{Clock, LivenessMonitor, SystemClock};
use crate::session::Session;
use crate::sink::EventSink;
use crate::transport::Transport;
use crate::types::{Announcement, ConnectionState, Error};
use crate::websocket::WebSocketTransport;

/// Handle to a broker listener.
///
/// [`connect`](Listener::connect) starts a background task that keeps the
/// subscription alive until the connection fails or [`stop`](Listener::stop)
/// is called. Control operations may be called from any task while it runs.
/// Outcomes are reported only through the [`EventSink`].
///
/// Must be used inside a Tokio runtime.
pub struct Listener {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Listener {
    /// Create a listener that talks to the broker over WebSocket.
    pub fn new(config: ListenerConfig, sink: Arc<dyn EventSink>) -> Result<Self, Error> {
        Self::with_transport(
            config,
            sink,
            Arc::new(WebSocketTransport),
            Arc::new(SystemClock),
        )
    }

    /// Create a listener with a custom transport and wall clock.
    pub fn with_transport(
        config: ListenerConfig,
        sink: Arc<dyn EventSink>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, Error> {
        let session = Session::new(&config, transport)?;
        let monitor = LivenessMonitor::new(&config.timing, clock);
        let mut topics: Vec<String> = Vec::with_capacity(config.topics.len());
        for topic in config.topics {
            if !topic.is_empty() && !topics.contains(&topic) {
                topics.push(topic);
            }
        }
        let shared = Shared::new(session, monitor, sink, config.timing, topics);
        Ok(Self {
            shared: Arc::new(shared),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state() == ConnectionState::Connecting
    }

    /// Wall-clock time of the last successful contact with the broker.
    pub fn last_contact(&self) -> DateTime<Utc> {
        self.shared.monitor.last_contact()
    }

    /// Topics subscribed on every connect.
    pub fn topics(&self) -> Vec<String> {
        self.shared.topics()
    }

    /// Announcements waiting for the next connection.
    pub fn queued_announcements(&self) -> usize {
        self.shared.queued_announcements()
    }

    /// Start a connect attempt. Ignored unless currently disconnected.
    pub fn connect(&self) {
        let Some((epoch, cancel)) = self.shared.begin_connect() else {
            tracing::debug!(state = ?self.state(), "Connect ignored");
            return;
        };
        tracing::debug!(epoch, server = %self.shared.session.control_endpoint(), "Starting listener");
        let handle = tokio::spawn(run_receive_loop(self.shared.clone(), epoch, cancel));
        let mut workers = lock(&self.workers);
        workers.retain(|w| !w.is_finished());
        workers.push(handle);
    }

    /// Listen to `topic` as well, now if connected and on every later connect.
    ///
    /// A subscribe failure disconnects the listener.
    pub async fn also_listen_to(&self, topic: &str) {
        if topic.is_empty() {
            tracing::warn!("Ignoring empty topic");
            return;
        }
        if !self.shared.track_topic(topic) {
            tracing::debug!(topic, "Already listening");
            return;
        }
        match self.shared.connected_epoch() {
            Some(epoch) => {
                self.shared.subscribe_topic(epoch, topic).await;
            }
            None => tracing::info!(topic, "Not connected, subscribing on connect"),
        }
    }

    /// Publish `announcement` to the broker.
    ///
    /// When disconnected, or when sending fails, the announcement is queued
    /// and sent after the next successful connect. A send failure disconnects
    /// the listener.
    pub async fn announce(&self, announcement: Announcement) {
        let Some(epoch) = self.shared.connected_epoch() else {
            tracing::info!(topic = announcement.topic(), "Not connected, queuing announcement");
            self.shared.queue_announcement(announcement);
            return;
        };
        if !self.shared.send_announcement(epoch, &announcement).await {
            self.shared.queue_announcement(announcement);
        }
    }

    /// Stop the background task and wait for it to finish.
    ///
    /// A live connection is torn down with [`DisconnectReason::Requested`](crate::DisconnectReason::Requested).
    /// Calling this again is a no-op.
    pub async fn stop(&self) {
        self.shared.request_stop();
        let workers = std::mem::take(&mut *lock(&self.workers));
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!("Listener task failed: {e}");
            }
        }
    }

    /// Stop, join the background task, then release the session.
    pub async fn dispose(self) {
        self.stop().await;
        self.shared.session.dispose().await;
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shared.request_stop();
    }
}
