mod announce;
mod listen;

use std::path::PathBuf;

use announce_listener::{Event, ListenerConfig, TimingConfig};
use clap::Args;
use serde::Serialize;

use crate::config::{self, CliConfig};
use crate::error::{CliError, CliResult};

pub use announce::{AnnounceArgs, run_announce};
pub use listen::{ListenArgs, run_listen};

/// Broker options shared by every subcommand.
#[derive(Args, Debug)]
pub struct BrokerArgs {
    /// Broker base address; the publish channel is on the next port
    #[arg(long, env = "ANNOUNCE_SERVER")]
    server: Option<String>,

    /// YAML file with server, topics and timing overrides
    #[arg(long, env = "ANNOUNCE_CONFIG")]
    config: Option<PathBuf>,
}

impl BrokerArgs {
    /// Merge flags over the optional config file. Flags win; topics add up.
    async fn listener_config(&self, topics: &[String]) -> CliResult<ListenerConfig> {
        let file = match &self.config {
            Some(path) => config::load(path).await?,
            None => CliConfig::default(),
        };
        let server = self
            .server
            .clone()
            .or(file.server)
            .ok_or_else(|| CliError::Config("no server given (--server or config file)".into()))?;
        let mut listener = ListenerConfig::new(&server)?.with_timing(TimingConfig::from(file.timing));
        for topic in file.topics.into_iter().chain(topics.iter().cloned()) {
            if !listener.topics.contains(&topic) {
                listener = listener.with_topic(topic);
            }
        }
        Ok(listener)
    }
}

/// One line of `listen` output.
#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum EventLine<'a> {
    Connected,
    Disconnected { reason: String, message: &'a str },
    Announcement { topic: &'a str, message: &'a str },
}

impl<'a> From<&'a Event> for EventLine<'a> {
    fn from(event: &'a Event) -> Self {
        match event {
            Event::Connected => Self::Connected,
            Event::Disconnected { reason, message } => Self::Disconnected {
                reason: reason.to_string(),
                message,
            },
            Event::Announcement(a) => Self::Announcement {
                topic: a.topic(),
                message: a.message(),
            },
        }
    }
}

fn print_event(event: &Event) {
    match serde_json::to_string(&EventLine::from(event)) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!("Failed to encode event: {e}"),
    }
}
