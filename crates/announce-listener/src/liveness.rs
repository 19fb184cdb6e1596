//! Liveness tracking: last contact, heartbeat pings and sleep detection.
//!
//! Two clocks are involved. The heartbeat threshold counts idle
//! units added by the receive loop, so it only advances while the loop is
//! actually running. Sleep detection compares wall-clock time against the
//! last contact, so it notices when the host was suspended: the loop resumes
//! with barely any idle units counted while hours of wall time have passed.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::Error;
use crate::config::TimingConfig;
use crate::protocol::PING;
use crate::session::Session;

/// Source of wall-clock time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Useful for simulating host sleep.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let delta = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
        let mut now = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *now = now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Tracks the last successful contact with the broker.
///
/// Readable and writable from any task; the stored timestamp never moves
/// backwards.
pub struct LivenessMonitor {
    clock: Arc<dyn Clock>,
    last_contact_ms: AtomicI64,
    heartbeat_units: u32,
    sleep_threshold_ms: i64,
}

impl LivenessMonitor {
    pub fn new(timing: &TimingConfig, clock: Arc<dyn Clock>) -> Self {
        let heartbeat_ms = timing.heartbeat_interval().as_millis() as f64;
        Self {
            last_contact_ms: AtomicI64::new(clock.now().timestamp_millis()),
            clock,
            heartbeat_units: timing.heartbeat_units,
            sleep_threshold_ms: (heartbeat_ms * timing.sleep_factor) as i64,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Record a successful contact at the current time.
    pub fn on_contact(&self) {
        let now = self.clock.now().timestamp_millis();
        self.last_contact_ms.fetch_max(now, Ordering::AcqRel);
    }

    /// Forget previous contacts and start counting from now.
    pub fn reset(&self) {
        let now = self.clock.now().timestamp_millis();
        self.last_contact_ms.store(now, Ordering::Release);
    }

    pub fn last_contact(&self) -> DateTime<Utc> {
        let ms = self.last_contact_ms.load(Ordering::Acquire);
        DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn is_ping_due(&self, elapsed_units: u32) -> bool {
        elapsed_units >= self.heartbeat_units
    }

    /// Whether `now` is far enough past the last contact that the host most
    /// likely slept through several heartbeats.
    pub fn is_asleep(&self, now: DateTime<Utc>) -> bool {
        let last = self.last_contact_ms.load(Ordering::Acquire);
        now.timestamp_millis() >= last.saturating_add(self.sleep_threshold_ms)
    }

    /// Send a liveness probe over a fresh request socket.
    ///
    /// A missing or empty reply is [`Error::PingTimeout`]; transport errors
    /// are returned as they are.
    pub async fn ping(&self, session: &Session, timeout: Duration) -> Result<(), Error> {
        let server = session.control_endpoint();
        tracing::info!(%server, "Pinging");
        match session.request(PING, timeout).await {
            Ok(reply) if !reply.is_empty() => {
                tracing::info!(%server, "Received pong");
                Ok(())
            }
            Ok(_) | Err(Error::ReceiveTimeout) => {
                tracing::warn!(%server, "No pong");
                Err(Error::PingTimeout)
            }
            Err(e) => {
                tracing::warn!(%server, "Ping failed: {e}");
                Err(e)
            }
        }
    }
}

/// Duty-cycled idle counter driving the heartbeat.
///
/// Only iterations that received nothing advance it.
#[derive(Debug, Clone)]
pub struct IdleCounter {
    units: u32,
    step: u32,
}

impl IdleCounter {
    pub fn new(step: u32) -> Self {
        Self { units: 0, step }
    }

    /// Add one idle iteration; returns the accumulated units.
    pub fn advance(&mut self) -> u32 {
        self.units = self.units.saturating_add(self.step);
        self.units
    }

    pub fn reset(&mut self) {
        self.units = 0;
    }
}
