//! Error types for apiwire-client.

use thiserror::Error;

use crate::protocol::Trap;

/// Main error type for all apiwire operations.
#[derive(Debug, Error)]
pub enum ApiError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Socket-level failure reported by the connection task.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connect, login or read timed out.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol error (bad length prefix, invalid UTF-8, unknown reply type, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Login was rejected or could not be completed.
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// The device rejected a command.
    #[error("Device trap: {0}")]
    Trap(Trap),

    /// The device sent `!fatal`; the connection is gone.
    #[error("Fatal reply: {0}")]
    Fatal(String),

    /// A channel with this tag is already open.
    #[error("Channel {0} is already open")]
    DuplicateChannel(u32),

    /// The channel this handle refers to is no longer open.
    #[error("Unknown channel: {0}")]
    UnknownChannel(u32),

    /// Tag 0 was requested; tags start at 1.
    #[error("Channel tag must be positive")]
    InvalidTag,

    /// A command was written to a channel that is closing.
    #[error("Write after close on channel {0}")]
    WriteAfterClose(u32),

    /// The channel closed before the command could run.
    #[error("Channel {0} closed")]
    ChannelClosed(u32),

    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// TLS setup or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),
}

/// Reasons a login attempt fails.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// The challenge did not decode to exactly 16 bytes.
    #[error("malformed challenge ({len} bytes)")]
    MalformedChallenge {
        /// Decoded length, or 0 when the text was not valid hex.
        len: usize,
    },

    /// The device answered the login with one or more traps.
    #[error("rejected: {0}")]
    Rejected(Trap),

    /// The device sent `!fatal` during login.
    #[error("fatal: {0}")]
    Fatal(String),

    /// The transport ended before login completed.
    #[error("connection ended during login")]
    Interrupted,
}

/// Connection-level outcome delivered to every affected command handle.
///
/// Unlike [`ApiError`] this is `Clone`, so one failure can be broadcast to
/// all open channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// `!fatal` received.
    Fatal(String),
    /// Socket error, EOF or idle timeout.
    Transport(String),
    /// Corrupt byte stream.
    Protocol(String),
    /// The connection was closed locally.
    Closed,
    /// The channel was torn down before the command ran.
    ChannelClosed(u32),
}

impl From<Failure> for ApiError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Fatal(msg) => ApiError::Fatal(msg),
            Failure::Transport(msg) => ApiError::Transport(msg),
            Failure::Protocol(msg) => ApiError::Protocol(msg),
            Failure::Closed => ApiError::ConnectionClosed,
            Failure::ChannelClosed(tag) => ApiError::ChannelClosed(tag),
        }
    }
}

impl From<&ApiError> for Failure {
    fn from(err: &ApiError) -> Self {
        match err {
            ApiError::Protocol(msg) => Failure::Protocol(msg.clone()),
            ApiError::Fatal(msg) => Failure::Fatal(msg.clone()),
            ApiError::ConnectionClosed => Failure::Closed,
            other => Failure::Transport(other.to_string()),
        }
    }
}

/// Result type alias using ApiError.
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_into_api_error() {
        let err: ApiError = Failure::Fatal("session terminated".into()).into();
        assert!(matches!(err, ApiError::Fatal(ref m) if m == "session terminated"));

        let err: ApiError = Failure::ChannelClosed(7).into();
        assert!(matches!(err, ApiError::ChannelClosed(7)));

        let err: ApiError = Failure::Closed.into();
        assert!(matches!(err, ApiError::ConnectionClosed));
    }

    #[test]
    fn test_failure_from_api_error() {
        let io = ApiError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(matches!(Failure::from(&io), Failure::Transport(_)));
        assert_eq!(
            Failure::from(&ApiError::Protocol("bad".into())),
            Failure::Protocol("bad".into())
        );
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            ApiError::DuplicateChannel(3).to_string(),
            "Channel 3 is already open"
        );
        assert_eq!(
            AuthError::MalformedChallenge { len: 4 }.to_string(),
            "malformed challenge (4 bytes)"
        );
    }
}
