//! Error types for the relay-mesh core.

use thiserror::Error;

/// Result type alias using relay-mesh Error.
pub type Result<T> = std::result::Result<T, Error>;

/// relay-mesh error types.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network error (connection refused, socket closed, relay rejected).
    #[error("Network error: {0}")]
    Network(String),

    /// An operation did not complete within its deadline.
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// Low-level transport error (WebSocket framing, TLS, handshake).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Storage quota would be exceeded by a write.
    #[error("Storage quota exceeded: needed {needed} bytes, {available} available")]
    QuotaExceeded {
        /// Bytes the rejected write required.
        needed: u64,
        /// Bytes still available under the quota.
        available: u64,
    },

    /// Data read from storage or received from a relay has an unexpected shape.
    #[error("Malformed data: {0}")]
    Malformed(String),

    /// Persistence/storage error.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Validation error (invalid input data such as a bad relay URL).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the error is a transient network condition worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::Timeout(_) | Error::Transport(_)
        )
    }

    /// Whether the error came from the storage quota.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Error::QuotaExceeded { .. })
    }
}
