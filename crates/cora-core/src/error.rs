//! Error types for cora-core.

use thiserror::Error;

use crate::protocol::SessionNo;

/// Main error type for cora operations.
///
/// This covers synchronous failures only. Anything that happens after an
/// operation has been accepted is reported through the owning component's
/// client callbacks as a failure enum.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Truncated or malformed wire data.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// Protocol violation (unexpected message, bad correlation).
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Operation not allowed in the component's current state.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Malformed or missing parameters.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The session has already been closed.
    #[error("session closed")]
    SessionClosed,

    /// No receiver is registered for the given session.
    #[error("unknown session: {0}")]
    UnknownSession(SessionNo),

    /// Transport layer error.
    #[error("transport error: {message}")]
    Transport { message: String },
}

impl Error {
    /// Shorthand for a codec error describing truncated data.
    pub fn truncated(what: &str) -> Self {
        Error::Codec {
            message: format!("message truncated reading {}", what),
        }
    }

    /// Returns true if this error came from decoding wire data.
    ///
    /// Parse errors are never fatal to a connection: the affected item or
    /// notification is dropped and reported as an `Unknown` outcome.
    pub fn is_parse_error(&self) -> bool {
        matches!(self, Error::Codec { .. })
    }

    /// Returns true if the error means the transport can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Transport { .. } | Error::SessionClosed
        )
    }
}

/// Convenience result type for cora operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_codec() {
        let err = Error::truncated("u4");
        assert_eq!(err.to_string(), "codec error: message truncated reading u4");
    }

    #[test]
    fn error_display_invalid_state() {
        let err = Error::InvalidState {
            expected: "standby".into(),
            actual: "ready".into(),
        };
        assert_eq!(err.to_string(), "invalid state: expected standby, got ready");
    }

    #[test]
    fn error_display_unknown_session() {
        let err = Error::UnknownSession(SessionNo(7));
        assert_eq!(err.to_string(), "unknown session: 7");
    }

    #[test]
    fn io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn parse_errors_are_not_fatal() {
        let err = Error::truncated("string");
        assert!(err.is_parse_error());
        assert!(!err.is_fatal());

        assert!(!Error::SessionClosed.is_parse_error());
        assert!(Error::SessionClosed.is_fatal());
        assert!(!Error::InvalidArgument {
            message: "x".into()
        }
        .is_fatal());
    }
}
