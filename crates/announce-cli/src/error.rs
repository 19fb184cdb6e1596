use announce_listener::DisconnectReason;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("listener error: {0}")]
    Listener(#[from] announce_listener::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("disconnected ({reason}): {message}")]
    Disconnected {
        reason: DisconnectReason,
        message: String,
    },

    #[error("not connected after {0}s")]
    ConnectTimeout(u64),

    #[error("{0} announcement(s) not delivered")]
    Undelivered(usize),
}

pub type CliResult<T> = Result<T, CliError>;
