//! Resilient pub/sub listener for a revision-announcement broker.
//!
//! Subscribes to folder topics on a broker and reports announcements
//! (topic + revision) through an [`EventSink`], while keeping the
//! connection honest on its own.
//!
//! # Features
//! - Two-frame subscriber protocol (topic frame, then payload frame)
//! - Heartbeat ping once enough idle iterations accumulate
//! - Sleep/wake detection from wall-clock gaps
//! - Single teardown per connection, however many tasks observe the failure
//! - Topics re-subscribed and queued announcements flushed on every connect
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), announce_listener::Error> {
//! use std::sync::Arc;
//! use announce_listener::{ChannelSink, Event, Listener, ListenerConfig};
//!
//! let config = ListenerConfig::new("tcp://127.0.0.1:22000")?.with_topic("proj1");
//! let (sink, mut events) = ChannelSink::new();
//! let listener = Listener::new(config, Arc::new(sink))?;
//! listener.connect();
//!
//! while let Some(event) = events.next().await {
//!     match event {
//!         Event::Announcement(a) => println!("{} -> {}", a.topic(), a.message()),
//!         Event::Disconnected { reason, .. } => {
//!             println!("disconnected: {reason}");
//!             break;
//!         }
//!         Event::Connected => println!("connected"),
//!     }
//! }
//! listener.dispose().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod listener;
mod liveness;
pub mod protocol;
mod session;
mod sink;
#[cfg(test)]
mod testing;
mod transport;
mod types;
mod websocket;

pub use config::{ListenerConfig, TimingConfig};
pub use listener::Listener;
pub use liveness::{Clock, LivenessMonitor, ManualClock, SystemClock};
pub use session::Session;
pub use sink::{ChannelSink, EventSink, Events};
pub use transport::{RequestSocket, SubscriberReader, SubscriberSocket, SubscriberWriter, Transport};
pub use types::{Announcement, ConnectionState, DisconnectReason, Error, Event};
pub use websocket::WebSocketTransport;
