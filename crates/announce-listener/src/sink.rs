//! Event sink: where lifecycle callbacks and announcements go.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::types::{Announcement, DisconnectReason, Event};

/// Receives listener callbacks.
///
/// Callbacks run on the listener's task (or on the task of a failing control
/// operation) and must not block.
pub trait EventSink: Send + Sync + 'static {
    fn on_connected(&self);
    fn on_disconnected(&self, reason: DisconnectReason, message: &str);
    fn on_announcement(&self, announcement: Announcement);
}

/// Sink that forwards callbacks as [`Event`]s over a channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Event>,
    undelivered: AtomicU64,
}

impl ChannelSink {
    /// Create a sink and the receiver its events arrive on.
    pub fn new() -> (Self, Events) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            tx,
            undelivered: AtomicU64::new(0),
        };
        (sink, Events { rx })
    }

    /// Events dropped because the receiver was gone.
    pub fn undelivered(&self) -> u64 {
        self.undelivered.load(Ordering::Relaxed)
    }

    fn emit(&self, event: Event) {
        if self.tx.send(event).is_err() {
            let total = self.undelivered.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(total_undelivered = total, "event receiver closed, dropping event");
        }
    }
}

impl EventSink for ChannelSink {
    fn on_connected(&self) {
        self.emit(Event::Connected);
    }

    fn on_disconnected(&self, reason: DisconnectReason, message: &str) {
        self.emit(Event::Disconnected {
            reason,
            message: message.to_string(),
        });
    }

    fn on_announcement(&self, announcement: Announcement) {
        self.emit(Event::Announcement(announcement));
    }
}

/// Receiving end of a [`ChannelSink`].
pub struct Events {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Events {
    /// Receive the next event. Returns `None` once the sink is dropped.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Take an event if one is already queued.
    pub fn try_next(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}
