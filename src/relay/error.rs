// Error taxonomy for the relay core

use thiserror::Error;

/// Errors surfaced by sessions, the wire codec and the user directory.
///
/// Only `Protocol` is recoverable inside a session: the offending record is
/// answered with an ERROR record and the connection stays open. Everything
/// else ends the session (or the handshake) and is absorbed at the session
/// boundary.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed or unexpected record
    #[error("{0}")]
    Protocol(String),

    /// Bad credentials or a failed handshake
    #[error("authentication failed for {identity}")]
    Auth { identity: String },

    /// I/O failure on the connection
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The user directory could not answer
    #[error("user directory error: {0}")]
    Directory(#[source] anyhow::Error),

    /// A record could not be encoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    pub fn protocol(message: impl Into<String>) -> Self {
        RelayError::Protocol(message.into())
    }

    /// Whether the session may keep running after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RelayError::Protocol(_))
    }
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;
