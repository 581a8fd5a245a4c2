//! Error types for the lobby session client.

use thiserror::Error;

use crate::connection::Generation;

/// Broad classification of a [`LobbyError`], used to decide how an error
/// propagates (absorbed by the reconnection policy, surfaced to the UI, or
/// rejected locally).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport-level drop or failure. Retryable.
    Connection,
    /// The server rejected a command, or sent something undecodable.
    Protocol,
    /// Local input problem caught before any network call.
    Validation,
    /// A command was issued but no answer arrived within the deadline.
    Timeout,
    /// Persisting the session record failed.
    Storage,
}

/// Local validation failures. Raised before anything touches the network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("display name must not be empty")]
    EmptyDisplayName,

    #[error("display name must be between {min} and {max} characters")]
    DisplayNameLength { min: usize, max: usize },

    #[error("room code must not be empty")]
    EmptyRoomCode,

    #[error("room code must be at most {max} ASCII letters or digits")]
    InvalidRoomCode { max: usize },

    #[error("{field} must be between {min} and {max}, got {value}")]
    SettingOutOfRange {
        field: &'static str,
        min: u32,
        max: u32,
        value: u32,
    },
}

/// Errors that can occur when using the lobby session client.
#[derive(Debug, Error)]
pub enum LobbyError {
    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Attempted an operation that requires a live channel, but there is none.
    #[error("not connected to server")]
    NotConnected,

    /// A command was addressed to a channel generation that has been superseded.
    #[error("channel generation {0} is no longer current")]
    StaleGeneration(Generation),

    /// Attempted a room operation but no room has been established.
    #[error("not in a room")]
    NotInRoom,

    /// A host-only operation was attempted by a guest.
    #[error("only the host can do that")]
    NotHost,

    /// A guest tried to negotiate without a cached room code.
    #[error("cannot join a room without a room code")]
    MissingRoomCode,

    /// Local input was rejected.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The server answered with a `room_error`.
    #[error("server error: {message}")]
    Server {
        /// Human-readable error message from the server.
        message: String,
        /// Fatal errors force a return to the entry screen.
        fatal: bool,
    },

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Reading or writing the persisted session record failed.
    #[error("session storage error: {0}")]
    Storage(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LobbyError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransportSend(_)
            | Self::TransportReceive(_)
            | Self::TransportClosed
            | Self::NotConnected
            | Self::StaleGeneration(_)
            | Self::Io(_) => ErrorKind::Connection,
            Self::Serialization(_) | Self::Server { .. } => ErrorKind::Protocol,
            Self::NotInRoom | Self::NotHost | Self::MissingRoomCode | Self::Validation(_) => {
                ErrorKind::Validation
            }
            Self::Timeout => ErrorKind::Timeout,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Returns `true` for errors the reconnection policy may retry on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection | ErrorKind::Timeout)
    }
}

/// A specialized [`Result`] type for lobby client operations.
pub type Result<T> = std::result::Result<T, LobbyError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_taxonomy() {
        assert_eq!(LobbyError::TransportClosed.kind(), ErrorKind::Connection);
        assert_eq!(
            LobbyError::Server {
                message: "room full".into(),
                fatal: false
            }
            .kind(),
            ErrorKind::Protocol
        );
        assert_eq!(LobbyError::MissingRoomCode.kind(), ErrorKind::Validation);
        assert_eq!(
            LobbyError::from(ValidationError::EmptyDisplayName).kind(),
            ErrorKind::Validation
        );
        assert_eq!(LobbyError::Timeout.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn only_connection_and_timeout_errors_are_retryable() {
        assert!(LobbyError::TransportReceive("reset".into()).is_retryable());
        assert!(LobbyError::Timeout.is_retryable());
        assert!(!LobbyError::MissingRoomCode.is_retryable());
        assert!(!LobbyError::Server {
            message: "kicked".into(),
            fatal: true
        }
        .is_retryable());
    }

    #[test]
    fn validation_error_display_is_transparent() {
        let err = LobbyError::from(ValidationError::DisplayNameLength { min: 2, max: 20 });
        assert_eq!(
            err.to_string(),
            "display name must be between 2 and 20 characters"
        );
    }
}
