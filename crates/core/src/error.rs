use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Structured error declared by the remote peer ({code, message}).
    #[error("Remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    /// The underlying channel closed before a reply arrived.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Recovery/reconnection ran out of attempts. Terminal and
    /// user-actionable: the message says what to restart.
    #[error("{0}")]
    Exhausted(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
