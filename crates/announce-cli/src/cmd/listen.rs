use std::sync::Arc;
use std::time::Duration;

use announce_listener::{ChannelSink, DisconnectReason, Event, Listener};
use clap::Args;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{BrokerArgs, print_event};
use crate::error::{CliError, CliResult};

/// Initial delay before reconnecting after a disconnect.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// Maximum delay between reconnect attempts.
const BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Args, Debug)]
pub struct ListenArgs {
    #[command(flatten)]
    broker: BrokerArgs,

    /// Topics to listen to (in addition to those in the config file)
    topics: Vec<String>,

    /// Give up after this many consecutive failed connections
    #[arg(long)]
    max_failures: Option<u32>,
}

/// Backoff state for reconnecting the listener.
struct RetryState {
    restart_at: Option<Instant>,
    backoff: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
    consecutive_failures: u32,
    /// `None` = retry forever.
    max_failures: Option<u32>,
}

impl RetryState {
    fn new(initial: Duration, max: Duration, max_failures: Option<u32>) -> Self {
        Self {
            restart_at: None,
            backoff: initial,
            backoff_initial: initial,
            backoff_max: max,
            consecutive_failures: 0,
            max_failures,
        }
    }

    /// Reset backoff and failure count after a successful connect.
    fn on_success(&mut self) {
        self.backoff = self.backoff_initial;
        self.consecutive_failures = 0;
    }

    /// Record a failure, schedule a retry and double the backoff (capped).
    /// Returns `false` once `max_failures` is reached.
    #[must_use]
    fn on_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        if self
            .max_failures
            .is_some_and(|max| self.consecutive_failures >= max)
        {
            return false;
        }
        self.restart_at = Some(Instant::now() + self.backoff);
        self.backoff = (self.backoff * 2).min(self.backoff_max);
        true
    }

    fn clear_timer(&mut self) {
        self.restart_at = None;
    }
}

/// Sleep until the restart timer fires, or pend forever if none is scheduled.
async fn sleep_until_retry(restart_at: Option<Instant>) {
    match restart_at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Print every event as a JSON line and reconnect with backoff until ctrl-c.
pub async fn run_listen(args: ListenArgs) -> CliResult<()> {
    let config = args.broker.listener_config(&args.topics).await?;
    if config.topics.is_empty() {
        return Err(CliError::Config("no topics to listen to".into()));
    }
    info!(server = %config.server(), topics = ?config.topics, "Listening");

    let (sink, mut events) = ChannelSink::new();
    let listener = Listener::new(config, Arc::new(sink))?;
    let mut retry = RetryState::new(BACKOFF_INITIAL, BACKOFF_MAX, args.max_failures);
    listener.connect();

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received ctrl-c, stopping");
                break Ok(());
            }
            _ = sleep_until_retry(retry.restart_at) => {
                retry.clear_timer();
                info!(attempt = retry.consecutive_failures + 1, "Reconnecting");
                listener.connect();
            }
            event = events.next() => {
                let Some(event) = event else {
                    break Ok(());
                };
                print_event(&event);
                match event {
                    Event::Connected => retry.on_success(),
                    Event::Disconnected { reason: DisconnectReason::Requested, .. } => {
                        break Ok(());
                    }
                    Event::Disconnected { reason, message } => {
                        if !retry.on_failure() {
                            warn!(failures = retry.consecutive_failures, "Giving up");
                            break Err(CliError::Disconnected { reason, message });
                        }
                        let delay = retry.restart_at.map(|at| at.saturating_duration_since(Instant::now()));
                        info!(?delay, "Reconnect scheduled");
                    }
                    Event::Announcement(_) => {}
                }
            }
        }
    };

    listener.dispose().await;
    result
}
