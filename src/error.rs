//! # Bridge Error Types
//!
//! Centralized error handling for the bridge endpoint.

use thiserror::Error;

use crate::encoding::EncodingError;
use crate::transport::TransportError;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Core error types for the bridge endpoint
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Configuration errors (missing/invalid key, unknown encoding, CA not found)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Wire encoding/decoding errors
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Transport errors (connect, send, close)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Type-name mismatch on a topic advertisement or subscription
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Request for a route (topic, service, call id) this endpoint does not track
    #[error("Unknown route: {0}")]
    UnknownRoute(String),

    /// I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BridgeError {
    /// Create a new configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new protocol mismatch error
    pub fn protocol_mismatch(msg: impl Into<String>) -> Self {
        Self::ProtocolMismatch(msg.into())
    }

    /// Create a new unknown route error
    pub fn unknown_route(msg: impl Into<String>) -> Self {
        Self::UnknownRoute(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::configuration("port is required");
        assert_eq!(err.to_string(), "Configuration error: port is required");

        let err = BridgeError::unknown_route("service 'add' is not provided");
        assert_eq!(err.to_string(), "Unknown route: service 'add' is not provided");
    }

    #[test]
    fn test_error_conversions() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: BridgeError = io.into();
        assert!(matches!(err, BridgeError::Io(_)));
    }
}
