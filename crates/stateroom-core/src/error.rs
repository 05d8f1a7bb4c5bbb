//! Error types for the stateroom crates.
//!
//! A single error enum is shared by the server, the client handle, and the
//! process-management crate. Server-side faults are converted into coded
//! error responses on the wire and reconstructed into typed errors on the
//! client, so a caller can match on conditions such as a missing key.

use thiserror::Error;

/// Result type alias for stateroom operations.
pub type Result<T> = std::result::Result<T, StateroomError>;

/// Main error type for stateroom operations.
#[derive(Debug, Error)]
pub enum StateroomError {
    // I/O and connectivity
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Server unreachable at {addr}: {message}")]
    Unreachable { addr: String, message: String },

    // Serialization
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Wire protocol
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // State semantics
    #[error("Key not found: {key}")]
    KeyNotFound { key: String },

    #[error("Invalid predicate: {message}")]
    InvalidPredicate { message: String },

    // Watch delivery
    #[error("Watch channel closed before delivery")]
    WatchLost,

    // Process lifecycle
    #[error("Process launch failed for {target}: {message}")]
    LaunchFailed { target: String, message: String },

    #[error("Unknown worker target: {target}")]
    UnknownTarget { target: String },

    #[error("Context already closed")]
    ContextClosed,

    // Generic errors
    #[error("{0}")]
    Other(String),
}

// Conversion implementations for common error types

impl From<std::io::Error> for StateroomError {
    fn from(err: std::io::Error) -> Self {
        StateroomError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for StateroomError {
    fn from(err: serde_json::Error) -> Self {
        StateroomError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl StateroomError {
    /// Convert to a wire error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32600: Invalid request
    /// - -32603: Internal error
    ///
    /// Application-defined codes (-32000 to -32099):
    /// - -32001: Missing key (dict semantics: delete/pop/getitem on an
    ///   absent key, popitem on an empty state)
    /// - -32002: Invalid predicate
    pub fn rpc_code(&self) -> i32 {
        match self {
            StateroomError::Json { .. } => -32700,
            StateroomError::Protocol { .. } => -32600,
            StateroomError::KeyNotFound { .. } => -32001,
            StateroomError::InvalidPredicate { .. } => -32002,
            _ => -32603,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StateroomError::KeyNotFound { key: "jobs".into() };
        assert_eq!(err.to_string(), "Key not found: jobs");
    }

    #[test]
    fn test_rpc_codes() {
        assert_eq!(
            StateroomError::KeyNotFound { key: "x".into() }.rpc_code(),
            -32001
        );
        assert_eq!(
            StateroomError::Protocol {
                message: "bad envelope".into()
            }
            .rpc_code(),
            -32600
        );
        assert_eq!(StateroomError::WatchLost.rpc_code(), -32603);
    }
}
