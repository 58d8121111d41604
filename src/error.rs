//! Tandem error types.
//!
//! # Error Classification
//!
//! Errors are grouped by who caused them and how far they reach:
//!
//! - **Negotiation races** (offer collisions, equal role seeds) and **transport faults**
//!   (ICE failure) never show up here. They are healed inside the engine.
//! - **Protocol violations** (`PayloadTooLarge`, `InvalidEnvelope`, `Protocol`) are returned
//!   synchronously from the call that broke the contract.
//! - **Remote-initiated termination** (`Canceled`, `Aborted`, `ClosedUnexpectedly`,
//!   `SocketClosed`) is scoped to one transaction or socket and never closes the engine.
//! - **Fatal signaling failure** (`Signaling`) closes the whole session.

use thiserror::Error;

/// Tandem errors.
#[derive(Error, Debug)]
pub enum TandemError {
    /// Binary payload exceeds the socket's maximum message size.
    #[error("Payload of {size} bytes exceeds the maximum of {max} bytes")]
    PayloadTooLarge {
        /// Size of the rejected payload.
        size: usize,
        /// Maximum accepted payload size.
        max: usize,
    },

    /// Signaling envelope is malformed (e.g. no `type` field).
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Wire-level protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote reader canceled the transaction.
    #[error("Transaction canceled: {0}")]
    Canceled(String),

    /// The remote writer aborted the transaction.
    #[error("Transaction aborted by sender: {name}: {message}")]
    Aborted {
        /// Error name reported by the sender.
        name: String,
        /// Error message reported by the sender.
        message: String,
    },

    /// The socket closed before the transaction completed.
    #[error("Socket has been closed unexpectedly: {0}")]
    ClosedUnexpectedly(String),

    /// Operation on a socket that is already closed.
    #[error("Socket closed: {0}")]
    SocketClosed(String),

    /// Fatal signaling failure; the session has been closed.
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// The engine has been closed.
    #[error("Engine closed")]
    Closed,

    /// Transport (peer connection or data channel) error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Offer/answer negotiation error.
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Tandem operations
pub type Result<T> = std::result::Result<T, TandemError>;

impl From<toml::de::Error> for TandemError {
    fn from(err: toml::de::Error) -> Self {
        TandemError::Config(err.to_string())
    }
}

impl TandemError {
    /// Whether this error terminates only one transaction or socket.
    pub fn is_stream_scoped(&self) -> bool {
        matches!(
            self,
            Self::Canceled(_)
                | Self::Aborted { .. }
                | Self::ClosedUnexpectedly(_)
                | Self::SocketClosed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canceled_message_contains_reason() {
        let err = TandemError::Canceled("no reason".to_string());
        assert!(err.to_string().contains("no reason"));
        assert!(err.is_stream_scoped());
    }

    #[test]
    fn test_session_errors_not_stream_scoped() {
        assert!(!TandemError::Closed.is_stream_scoped());
        assert!(!TandemError::Signaling("boom".into()).is_stream_scoped());
    }

    #[test]
    fn test_toml_error_maps_to_config() {
        let err: TandemError = toml::from_str::<toml::Value>("= broken")
            .unwrap_err()
            .into();
        assert!(matches!(err, TandemError::Config(_)));
    }
}
