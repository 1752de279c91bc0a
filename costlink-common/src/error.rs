//! Common error types for costlink
//!
//! Transport faults are handled inside the connection layer and only reach
//! request callers as [`Error::NotConnected`] or [`Error::ConnectionClosed`].
//! Application failures reported by the backend always reach the caller.

use thiserror::Error;

/// Common result type for costlink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by the sync client and its consumers
#[derive(Error, Debug)]
pub enum Error {
    /// A frame was sent while the connection was not open
    #[error("Not connected")]
    NotConnected,

    /// No response arrived within the request's timeout window
    #[error("Request timed out after {timeout_ms} ms ({kind}, messageId={message_id})")]
    RequestTimeout {
        kind: String,
        message_id: String,
        timeout_ms: u64,
    },

    /// The connection dropped while the request was outstanding
    #[error("Connection closed before a response arrived")]
    ConnectionClosed,

    /// The backend answered with `status: "error"`; message is passed verbatim
    #[error("Backend error ({kind}): {message}")]
    Application { kind: String, message: String },

    /// Inbound frame did not parse as a known structure
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The caller cancelled the request before it settled
    #[error("Request cancelled")]
    Cancelled,

    /// Transport-level failure (open, read or write)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures caused by connectivity rather than by the backend
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Error::NotConnected | Error::ConnectionClosed | Error::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_application_error_message_is_verbatim() {
        let err = Error::Application {
            kind: "save_cost_data".to_string(),
            message: "Project 42 is locked".to_string(),
        };
        assert_eq!(err.to_string(), "Backend error (save_cost_data): Project 42 is locked");
    }

    #[test]
    fn test_connectivity_classification() {
        assert!(Error::NotConnected.is_connectivity());
        assert!(Error::ConnectionClosed.is_connectivity());
        assert!(!Error::Cancelled.is_connectivity());
        assert!(!Error::RequestTimeout {
            kind: "match_codes".into(),
            message_id: "x".into(),
            timeout_ms: 10,
        }
        .is_connectivity());
    }
}
