//! Listener configuration and broker endpoint derivation.

use std::time::Duration;

use url::Url;

use crate::Error;

pub(crate) const DEFAULT_TOPIC_TIMEOUT: Duration = Duration::from_secs(4);
pub(crate) const DEFAULT_PAYLOAD_TIMEOUT: Duration = Duration::from_secs(2);
pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(4);
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_HEARTBEAT_UNITS: u32 = 300;
pub(crate) const DEFAULT_IDLE_STEP: u32 = 6;
pub(crate) const DEFAULT_UNIT: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_SLEEP_FACTOR: f64 = 1.2;

/// Timing knobs for the receive loop and liveness checks.
///
/// The heartbeat is counted in idle units: every iteration that receives
/// nothing adds `idle_step` units, and a ping is sent once `heartbeat_units`
/// is reached. Sleep detection instead compares wall-clock time against
/// `heartbeat_interval() * sleep_factor`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingConfig {
    /// Bounded wait for the topic frame.
    pub topic_timeout: Duration,
    /// Bounded wait for the payload frame that follows a topic.
    pub payload_timeout: Duration,
    /// Reply wait for ping and announce requests.
    pub request_timeout: Duration,
    /// Upper bound on establishing the subscriber connection.
    pub connect_timeout: Duration,
    pub heartbeat_units: u32,
    pub idle_step: u32,
    /// Wall-clock length of one idle unit.
    pub unit: Duration,
    pub sleep_factor: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            topic_timeout: DEFAULT_TOPIC_TIMEOUT,
            payload_timeout: DEFAULT_PAYLOAD_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_units: DEFAULT_HEARTBEAT_UNITS,
            idle_step: DEFAULT_IDLE_STEP,
            unit: DEFAULT_UNIT,
            sleep_factor: DEFAULT_SLEEP_FACTOR,
        }
    }
}

impl TimingConfig {
    /// Heartbeat period as a wall-clock duration.
    pub fn heartbeat_interval(&self) -> Duration {
        self.unit.saturating_mul(self.heartbeat_units)
    }
}

/// Configuration for a [`Listener`](crate::Listener).
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    server: Url,
    /// Topics subscribed on every connect.
    pub topics: Vec<String>,
    pub timing: TimingConfig,
}

impl ListenerConfig {
    /// Parse the broker base address (`tcp://host:port`, `ws://…` or `wss://…`).
    ///
    /// The address must carry a host and an explicit port below 65535, since
    /// the publish channel lives on `port + 1`.
    pub fn new(server: &str) -> Result<Self, Error> {
        let server = Url::parse(server)?;
        if !matches!(server.scheme(), "tcp" | "ws" | "wss") {
            return Err(Error::InvalidAddress(format!(
                "unsupported scheme: {}",
                server.scheme()
            )));
        }
        if server.host_str().is_none_or(str::is_empty) {
            return Err(Error::InvalidAddress(format!("missing host: {server}")));
        }
        let port = server
            .port_or_known_default()
            .ok_or_else(|| Error::InvalidAddress(format!("missing port: {server}")))?;
        if port == u16::MAX {
            return Err(Error::InvalidAddress(format!(
                "port {port} leaves no room for the publish channel"
            )));
        }
        Ok(Self {
            server,
            topics: Vec::new(),
            timing: TimingConfig::default(),
        })
    }

    /// Add a topic to subscribe on connect.
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// The address as given.
    pub fn server(&self) -> &Url {
        &self.server
    }

    /// Request/reply endpoint on the base port.
    pub fn control_endpoint(&self) -> Result<Url, Error> {
        websocket_url(&self.server, None)
    }

    /// Publish endpoint on `port + 1`.
    pub fn pub_endpoint(&self) -> Result<Url, Error> {
        let port = self
            .server
            .port_or_known_default()
            .and_then(|p| p.checked_add(1))
            .ok_or_else(|| Error::InvalidAddress(format!("no publish port for {}", self.server)))?;
        websocket_url(&self.server, Some(port))
    }
}

fn websocket_url(server: &Url, port: Option<u16>) -> Result<Url, Error> {
    let scheme = match server.scheme() {
        "wss" => "wss",
        _ => "ws",
    };
    let host = server
        .host_str()
        .ok_or_else(|| Error::InvalidAddress(format!("missing host: {server}")))?;
    let port = port
        .or_else(|| server.port_or_known_default())
        .ok_or_else(|| Error::InvalidAddress(format!("missing port: {server}")))?;
    Ok(Url::parse(&format!("{scheme}://{host}:{port}{}", server.path()))?)
}
