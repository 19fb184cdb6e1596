use std::sync::Arc;
use std::time::Duration;

use announce_listener::{Announcement, ChannelSink, Event, Listener};
use clap::Args;
use tracing::info;

use super::BrokerArgs;
use crate::error::{CliError, CliResult};

#[derive(Args, Debug)]
pub struct AnnounceArgs {
    #[command(flatten)]
    broker: BrokerArgs,

    /// Topic to announce on
    topic: String,

    /// Message (remaining words are joined with spaces)
    #[arg(required = true, num_args = 1..)]
    message: Vec<String>,

    /// Seconds to wait for the broker connection
    #[arg(long, default_value_t = 30)]
    wait: u64,
}

/// Connect, send one announcement, and report whether it was delivered.
pub async fn run_announce(args: AnnounceArgs) -> CliResult<()> {
    let announcement = Announcement::new(args.topic, args.message.join(" "))
        .ok_or_else(|| CliError::Config("topic and message must not be empty".into()))?;
    let config = args.broker.listener_config(&[]).await?;

    let (sink, mut events) = ChannelSink::new();
    let listener = Listener::new(config, Arc::new(sink))?;
    listener.connect();

    let result = async {
        let first = tokio::time::timeout(Duration::from_secs(args.wait), events.next())
            .await
            .map_err(|_| CliError::ConnectTimeout(args.wait))?;
        match first {
            Some(Event::Connected) => {}
            Some(Event::Disconnected { reason, message }) => {
                return Err(CliError::Disconnected { reason, message });
            }
            _ => return Err(CliError::ConnectTimeout(args.wait)),
        }

        listener.announce(announcement.clone()).await;
        let undelivered = listener.queued_announcements();
        if undelivered > 0 {
            return Err(CliError::Undelivered(undelivered));
        }
        info!(
            topic = announcement.topic(),
            message = announcement.message(),
            "Announcement delivered"
        );
        Ok(())
    }
    .await;

    listener.dispose().await;
    result
}
