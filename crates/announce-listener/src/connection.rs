//! Connection lifecycle: connect, receive loop, heartbeat and teardown.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::Error;
use crate::config::TimingConfig;
use crate::liveness::{IdleCounter, LivenessMonitor};
use crate::protocol::announce_command;
use crate::session::Session;
use crate::sink::EventSink;
use crate::transport::{SubscriberReader, SubscriberSocket, SubscriberWriter};
use crate::types::{Announcement, ConnectionState, DisconnectReason};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub(crate) const PING_TIMEOUT_MESSAGE: &str = "Ping timeout";
pub(crate) const STOP_MESSAGE: &str = "Disconnect requested";

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// One connect attempt. `epoch` increases with every `connect()`, so a
/// failure observed on an old connection never tears down a newer one.
struct Attempt {
    epoch: u64,
    cancel: CancellationToken,
}

/// State shared between the receive loop and control operations.
pub(crate) struct Shared {
    state: AtomicU8,
    attempt: Mutex<Attempt>,
    /// Serializes subscriber install/release with sink notifications.
    transition: tokio::sync::Mutex<()>,
    pub(crate) session: Session,
    pub(crate) monitor: LivenessMonitor,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) timing: TimingConfig,
    topics: Mutex<Vec<String>>,
    outbox: Mutex<VecDeque<Announcement>>,
}

impl Shared {
    pub(crate) fn new(
        session: Session,
        monitor: LivenessMonitor,
        sink: Arc<dyn EventSink>,
        timing: TimingConfig,
        topics: Vec<String>,
    ) -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            attempt: Mutex::new(Attempt {
                epoch: 0,
                cancel: CancellationToken::new(),
            }),
            transition: tokio::sync::Mutex::new(()),
            session,
            monitor,
            sink,
            timing,
            topics: Mutex::new(topics),
            outbox: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move Disconnected → Connecting and open a new attempt.
    pub(crate) fn begin_connect(&self) -> Option<(u64, CancellationToken)> {
        let mut attempt = lock(&self.attempt);
        self.state
            .compare_exchange(
                ConnectionState::Disconnected as u8,
                ConnectionState::Connecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()?;
        attempt.epoch += 1;
        attempt.cancel = CancellationToken::new();
        Some((attempt.epoch, attempt.cancel.clone()))
    }

    /// Cancel the current attempt. The loop observes it at its next
    /// suspension point.
    pub(crate) fn request_stop(&self) {
        lock(&self.attempt).cancel.cancel();
    }

    /// Epoch of the live connection, if connected.
    pub(crate) fn connected_epoch(&self) -> Option<u64> {
        let attempt = lock(&self.attempt);
        (self.state() == ConnectionState::Connected).then_some(attempt.epoch)
    }

    fn is_live(&self, epoch: u64) -> bool {
        self.connected_epoch() == Some(epoch)
    }

    fn mark_connected(&self, epoch: u64) -> bool {
        let attempt = lock(&self.attempt);
        attempt.epoch == epoch
            && self
                .state
                .compare_exchange(
                    ConnectionState::Connecting as u8,
                    ConnectionState::Connected as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
    }

    /// Single-transition guard: only one caller moves `epoch` out of
    /// Connecting/Connected.
    fn leave(&self, epoch: u64) -> bool {
        let attempt = lock(&self.attempt);
        if attempt.epoch != epoch {
            return false;
        }
        let current = self.state.load(Ordering::Acquire);
        if current == ConnectionState::Disconnected as u8 {
            return false;
        }
        let left = self
            .state
            .compare_exchange(
                current,
                ConnectionState::Disconnected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if left {
            attempt.cancel.cancel();
        }
        left
    }

    /// Tear down connection `epoch` and notify the sink, once.
    ///
    /// Returns `false` if the connection had already been torn down.
    pub(crate) async fn disconnect(
        &self,
        epoch: u64,
        reason: DisconnectReason,
        message: &str,
    ) -> bool {
        let _transition = self.transition.lock().await;
        if !self.leave(epoch) {
            return false;
        }
        self.session.release_subscriber().await;
        match reason {
            DisconnectReason::Requested => tracing::info!(%reason, "Disconnected: {message}"),
            _ => tracing::warn!(%reason, "Disconnected: {message}"),
        }
        self.sink.on_disconnected(reason, message);
        true
    }

    async fn enter_connected(
        &self,
        epoch: u64,
        writer: Box<dyn SubscriberWriter>,
    ) -> bool {
        let _transition = self.transition.lock().await;
        self.session.install_subscriber(writer).await;
        if !self.mark_connected(epoch) {
            self.session.release_subscriber().await;
            return false;
        }
        self.monitor.reset();
        tracing::info!(endpoint = %self.session.pub_endpoint(), "Connected");
        self.sink.on_connected();
        true
    }

    // -- topics --

    /// Add `topic` to the set subscribed on every connect. Returns `false`
    /// if it was already tracked.
    pub(crate) fn track_topic(&self, topic: &str) -> bool {
        let mut topics = lock(&self.topics);
        if topics.iter().any(|t| t == topic) {
            return false;
        }
        topics.push(topic.to_string());
        true
    }

    pub(crate) fn topics(&self) -> Vec<String> {
        lock(&self.topics).clone()
    }

    /// Subscribe `topic` on the live subscriber and refresh liveness.
    async fn try_subscribe(&self, topic: &str) -> Result<(), Error> {
        self.session.subscribe(topic).await?;
        tracing::debug!(topic, "Subscribed");
        self.monitor.on_contact();
        Ok(())
    }

    /// Subscribe `topic` on connection `epoch`; a failure disconnects it.
    pub(crate) async fn subscribe_topic(&self, epoch: u64, topic: &str) -> bool {
        match self.try_subscribe(topic).await {
            Ok(()) => true,
            Err(e) => {
                self.disconnect(epoch, DisconnectReason::TimeOut, &e.to_string())
                    .await;
                false
            }
        }
    }

    // -- announcements --

    pub(crate) fn queue_announcement(&self, announcement: Announcement) {
        lock(&self.outbox).push_back(announcement);
    }

    pub(crate) fn queued_announcements(&self) -> usize {
        lock(&self.outbox).len()
    }

    /// Send `announcement` over a request socket and wait for the ack.
    async fn try_announce(&self, announcement: &Announcement) -> Result<(), Error> {
        let command = announce_command(announcement);
        self.session
            .request(&command, self.timing.request_timeout)
            .await
            .map_err(|e| Error::Announce(e.to_string()))?;
        tracing::info!(topic = announcement.topic(), "Announced");
        self.monitor.on_contact();
        Ok(())
    }

    /// Send `announcement` on connection `epoch`.
    ///
    /// On failure the connection is torn down and the caller decides whether
    /// to requeue.
    pub(crate) async fn send_announcement(&self, epoch: u64, announcement: &Announcement) -> bool {
        match self.try_announce(announcement).await {
            Ok(()) => true,
            Err(e) => {
                self.disconnect(epoch, DisconnectReason::TimeOut, &e.to_string())
                    .await;
                false
            }
        }
    }

    /// Send queued announcements in order. A failed one goes back to the front.
    async fn flush_outbox(&self) -> Result<(), Error> {
        loop {
            let next = lock(&self.outbox).pop_front();
            let Some(announcement) = next else {
                return Ok(());
            };
            if let Err(e) = self.try_announce(&announcement).await {
                lock(&self.outbox).push_front(announcement);
                return Err(e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Background receive loop
// ---------------------------------------------------------------------------

enum TickOutcome {
    Continue,
    Disconnect(DisconnectReason, String),
}

type Teardown = (DisconnectReason, String);

fn requested() -> Teardown {
    (DisconnectReason::Requested, STOP_MESSAGE.to_string())
}

/// Drive one connect attempt from Connecting until it is torn down.
///
/// Teardown always runs here, outside the cancellable futures, so a
/// disconnect that cancels the attempt cannot interrupt its own notification.
pub(crate) async fn run_receive_loop(shared: Arc<Shared>, epoch: u64, cancel: CancellationToken) {
    let established = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(requested()),
        result = establish(&shared, epoch) => result,
    };
    let mut reader = match established {
        Ok(reader) => reader,
        Err((reason, message)) => {
            // No-op when a control operation already tore the attempt down.
            shared.disconnect(epoch, reason, &message).await;
            return;
        }
    };

    let mut idle = IdleCounter::new(shared.timing.idle_step);
    while shared.is_live(epoch) {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let (reason, message) = requested();
                TickOutcome::Disconnect(reason, message)
            }
            outcome = tick(&shared, reader.as_mut(), &mut idle) => outcome,
        };
        if let TickOutcome::Disconnect(reason, message) = outcome {
            shared.disconnect(epoch, reason, &message).await;
            break;
        }
    }
    tracing::debug!(epoch, "Receive loop exited");
}

/// Connect the subscriber, mark Connected, then restore topics and flush
/// queued announcements. Returns the read half, or how to tear down.
async fn establish(shared: &Shared, epoch: u64) -> Result<Box<dyn SubscriberReader>, Teardown> {
    tracing::info!(endpoint = %shared.session.pub_endpoint(), "Connecting");
    let SubscriberSocket { reader, writer } = shared
        .session
        .create_subscriber_socket()
        .await
        .map_err(|e| (DisconnectReason::TimeOut, e.to_string()))?;
    if !shared.enter_connected(epoch, writer).await {
        return Err(requested());
    }
    for topic in shared.topics() {
        shared
            .try_subscribe(&topic)
            .await
            .map_err(|e| (DisconnectReason::TimeOut, e.to_string()))?;
    }
    shared
        .flush_outbox()
        .await
        .map_err(|e| (DisconnectReason::TimeOut, e.to_string()))?;
    Ok(reader)
}

async fn tick(
    shared: &Shared,
    reader: &mut dyn SubscriberReader,
    idle: &mut IdleCounter,
) -> TickOutcome {
    match receive_announcement(reader, &shared.timing).await {
        Ok(Some(announcement)) => {
            shared.monitor.on_contact();
            tracing::debug!(
                topic = announcement.topic(),
                message = announcement.message(),
                "Announcement received"
            );
            shared.sink.on_announcement(announcement);
            TickOutcome::Continue
        }
        Ok(None) => idle_tick(shared, idle).await,
        Err(e) => {
            tracing::warn!("Receive failed: {e}");
            TickOutcome::Disconnect(DisconnectReason::TimeOut, e.to_string())
        }
    }
}

/// Nothing arrived this iteration: advance the idle counter, check for a
/// wall-clock jump, and ping once the heartbeat threshold is reached.
async fn idle_tick(shared: &Shared, idle: &mut IdleCounter) -> TickOutcome {
    let units = idle.advance();

    // Checked before the ping so a wake-up is reported as SystemSleep.
    if shared.monitor.is_asleep(shared.monitor.now()) {
        tracing::info!("System woke up from sleep");
        return TickOutcome::Disconnect(
            DisconnectReason::SystemSleep,
            PING_TIMEOUT_MESSAGE.to_string(),
        );
    }

    if !shared.monitor.is_ping_due(units) {
        return TickOutcome::Continue;
    }

    match shared
        .monitor
        .ping(&shared.session, shared.timing.request_timeout)
        .await
    {
        Ok(()) => {
            shared.monitor.on_contact();
            idle.reset();
            TickOutcome::Continue
        }
        Err(e) => {
            tracing::debug!("Heartbeat failed: {e}");
            TickOutcome::Disconnect(DisconnectReason::TimeOut, PING_TIMEOUT_MESSAGE.to_string())
        }
    }
}

/// Read a topic frame then a payload frame, each with its own bound.
///
/// A timeout on either read is the normal idle signal, not an error.
async fn receive_announcement(
    reader: &mut dyn SubscriberReader,
    timing: &TimingConfig,
) -> Result<Option<Announcement>, Error> {
    let topic = receive_frame(reader, timing.topic_timeout).await?;
    let message = receive_frame(reader, timing.payload_timeout).await?;
    Ok(match (topic, message) {
        (Some(topic), Some(message)) => Announcement::new(topic, message),
        _ => None,
    })
}

async fn receive_frame(
    reader: &mut dyn SubscriberReader,
    timeout: std::time::Duration,
) -> Result<Option<String>, Error> {
    match tokio::time::timeout(timeout, reader.recv()).await {
        Ok(Ok(frame)) => Ok(Some(frame)),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(None),
    }
}
