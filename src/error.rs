//! Client error types.
//!
//! [`ClientError`] is the central error type for the crate. Connection-level
//! failures, server-returned RPC errors, malformed frames and configuration
//! problems each get their own variant so callers can decide what to retry.

use serde_json::Value;

/// Error enum returned by every fallible operation in the crate.
///
/// # Categories
///
/// | Variant            | Origin                                      |
/// |--------------------|---------------------------------------------|
/// | `Transport`        | socket failed to open or errored            |
/// | `ConnectionClosed` | connection dropped while a call was pending |
/// | `Rpc`              | server answered with an `error` object      |
/// | `Protocol`         | frame or payload did not match the protocol |
/// | `Auth`             | token acquisition failed                    |
/// | `Timeout`          | caller-bounded request expired              |
/// | `Config`           | invalid configuration value                 |
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connection failed to open or errored after opening.
    #[error("transport error: {0}")]
    Transport(String),

    /// Connection closed before the operation could complete.
    #[error("connection closed")]
    ConnectionClosed,

    /// Server returned an error payload for a request.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// Human-readable message from the server.
        message: String,
        /// Optional structured details.
        data: Option<Value>,
    },

    /// Inbound message or result did not have the expected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Bearer token could not be obtained.
    #[error("auth error: {0}")]
    Auth(String),

    /// Request did not receive a response within the caller's bound.
    #[error("request {method} timed out after {timeout_ms} ms")]
    Timeout {
        /// RPC method that timed out.
        method: String,
        /// Elapsed bound in milliseconds.
        timeout_ms: u64,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Endpoint URL could not be parsed.
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Serialization of an outbound message failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClientError {
    /// Returns the server error code for [`ClientError::Rpc`], `None` otherwise.
    #[must_use]
    pub const fn rpc_code(&self) -> Option<i64> {
        match self {
            Self::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns `true` for failures tied to the connection rather than to the
    /// request itself.
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::ConnectionClosed)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_code_only_for_rpc_errors() {
        let err = ClientError::Rpc {
            code: -32601,
            message: "method not found".to_string(),
            data: None,
        };
        assert_eq!(err.rpc_code(), Some(-32601));
        assert_eq!(ClientError::ConnectionClosed.rpc_code(), None);
    }

    #[test]
    fn connection_errors_are_flagged() {
        assert!(ClientError::ConnectionClosed.is_connection_error());
        assert!(ClientError::Transport("refused".to_string()).is_connection_error());
        assert!(!ClientError::Protocol("bad".to_string()).is_connection_error());
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = ClientError::Rpc {
            code: 404,
            message: "no such resource".to_string(),
            data: None,
        };
        assert_eq!(err.to_string(), "rpc error 404: no such resource");
    }
}
