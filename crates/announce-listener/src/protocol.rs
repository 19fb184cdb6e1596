//! Broker wire protocol: text commands carried one per frame.
//!
//! ## Frames
//!
//! | Channel   | Direction | Frame                          | Reply            |
//! |-----------|-----------|--------------------------------|------------------|
//! | control   | C→B       | `ping`                         | any non-empty    |
//! | control   | C→B       | `announce <topic> <message>`   | ignored, present |
//! | publish   | C→B       | `subscribe <topic>`            | none             |
//! | publish   | B→C       | `<topic>` then `<message>`     | none             |
//!
//! Topics never contain spaces; the announce message is everything after the
//! second space.

use crate::Announcement;

/// Liveness probe sent on the control channel.
pub const PING: &str = "ping";

pub const ANNOUNCE_PREFIX: &str = "announce";
pub const SUBSCRIBE_PREFIX: &str = "subscribe";

/// Build the announce command for `announcement`.
pub fn announce_command(announcement: &Announcement) -> String {
    format!(
        "{ANNOUNCE_PREFIX} {} {}",
        announcement.topic(),
        announcement.message()
    )
}

/// Build the subscribe command sent on the publish channel.
pub fn subscribe_command(topic: &str) -> String {
    format!("{SUBSCRIBE_PREFIX} {topic}")
}

/// A decoded client command, as seen by a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Announce(Announcement),
    Subscribe(String),
}

impl Command {
    /// Parse a single frame. Returns `None` for anything unrecognised.
    pub fn parse(frame: &str) -> Option<Self> {
        if frame == PING {
            return Some(Self::Ping);
        }
        let (verb, rest) = frame.split_once(' ')?;
        match verb {
            ANNOUNCE_PREFIX => {
                let (topic, message) = rest.split_once(' ')?;
                Announcement::new(topic, message).map(Self::Announce)
            }
            SUBSCRIBE_PREFIX if !rest.is_empty() => Some(Self::Subscribe(rest.to_string())),
            _ => None,
        }
    }
}
