//! Unified error handling for the Hot Rod client
//!
//! Every failure that reaches an operation is one of the variants below.
//! Errors are `Clone` because a single transport failure completes every
//! operation registered on the broken connection.

use std::fmt;
use std::io;
use thiserror::Error;

use crate::core::ServerAddress;
use crate::protocol::{ILLEGAL_LIFECYCLE_STATE, NODE_SUSPECTED};

/// Main error type for client operations
#[derive(Debug, Clone, Error)]
pub enum HotRodError {
    /// Connection-level failure: refused, reset, handshake failure, socket timeout
    #[error("Transport error on {address}: {message}")]
    Transport {
        address: ServerAddress,
        message: String,
    },

    /// Malformed server response
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The server answered with an error status
    #[error("Server error (status {status:#04x}) for message {message_id}: {message}")]
    Server {
        status: u8,
        message_id: u64,
        message: String,
    },

    /// Response for a message id nobody is waiting for
    #[error("Unknown message id {message_id} received from {address}")]
    UnknownMessageId {
        address: ServerAddress,
        message_id: u64,
    },

    /// Pool at capacity under the EXCEPTION policy
    #[error("Connection pool for {address} exhausted: {message}")]
    PoolExhausted {
        address: ServerAddress,
        message: String,
    },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// No server could be selected for an operation
    #[error("No server available for cache '{cache_name}'")]
    NoServerAvailable { cache_name: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The client is shutting down
    #[error("Client is shutting down")]
    Interrupted,

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Response decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Not enough bytes buffered yet; decoding resumes on the next read
    #[error("Incomplete data - need more bytes")]
    Incomplete,

    #[error("Invalid magic number: expected {expected:#04x}, got {actual:#04x}")]
    InvalidMagic { expected: u8, actual: u8 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid UTF-8 string in response")]
    InvalidUtf8,

    #[error("Variable length integer is too long")]
    VarIntOverflow,
}

/// Configuration-specific errors
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for client operations
pub type HotRodResult<T> = Result<T, HotRodError>;

/// Convenience methods for creating specific error types
impl HotRodError {
    /// Create a transport error
    pub fn transport<S: Into<String>>(address: &ServerAddress, message: S) -> Self {
        HotRodError::Transport {
            address: address.clone(),
            message: message.into(),
        }
    }

    /// Create a transport error from an I/O failure
    pub fn io(address: &ServerAddress, error: &io::Error) -> Self {
        HotRodError::Transport {
            address: address.clone(),
            message: error.to_string(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        HotRodError::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        HotRodError::Internal {
            message: message.into(),
        }
    }

    /// True when the server explicitly reported a failure
    pub fn is_server_error(&self) -> bool {
        matches!(self, HotRodError::Server { .. })
    }

    /// Node suspected or shutting down: worth retrying on another node
    pub fn is_transient_server_error(&self) -> bool {
        matches!(
            self,
            HotRodError::Server { status, .. }
                if *status == NODE_SUSPECTED || *status == ILLEGAL_LIFECYCLE_STATE
        )
    }

    /// Check if this error may be retried against another server
    pub fn is_retryable(&self) -> bool {
        match self {
            HotRodError::Transport { .. } => true,
            HotRodError::Decode(_) => true,
            HotRodError::UnknownMessageId { .. } => true,
            HotRodError::Server { .. } => self.is_transient_server_error(),
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            HotRodError::Config(_) => ErrorSeverity::Critical,
            HotRodError::Internal { .. } => ErrorSeverity::Critical,
            HotRodError::Decode(_) | HotRodError::UnknownMessageId { .. } => ErrorSeverity::Error,
            HotRodError::Transport { .. } => ErrorSeverity::Warning,
            HotRodError::Timeout { .. } => ErrorSeverity::Warning,
            HotRodError::PoolExhausted { .. } => ErrorSeverity::Warning,
            HotRodError::Interrupted => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the client
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> ServerAddress {
        ServerAddress::new("127.0.0.1", 11222)
    }

    #[test]
    fn test_error_creation() {
        let error = HotRodError::transport(&address(), "Connection refused");
        assert!(matches!(error, HotRodError::Transport { .. }));
        assert_eq!(
            error.to_string(),
            "Transport error on 127.0.0.1:11222: Connection refused"
        );
    }

    #[test]
    fn test_error_severity() {
        let config_error = HotRodError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        let io_error = io::Error::new(io::ErrorKind::ConnectionRefused, "test");
        assert_eq!(HotRodError::io(&address(), &io_error).severity(), ErrorSeverity::Warning);
    }

    #[test]
    fn test_error_retryability() {
        assert!(HotRodError::transport(&address(), "reset").is_retryable());
        assert!(HotRodError::from(DecodeError::VarIntOverflow).is_retryable());

        let config_error = HotRodError::Config(ConfigError::ValidationError("test".to_string()));
        assert!(!config_error.is_retryable());
        assert!(!HotRodError::Interrupted.is_retryable());
        assert!(!HotRodError::timeout("waiting for connection").is_retryable());
    }

    #[test]
    fn test_server_error_classification() {
        let suspected = HotRodError::Server {
            status: 0x87,
            message_id: 1,
            message: "node suspected".to_string(),
        };
        assert!(suspected.is_server_error());
        assert!(suspected.is_transient_server_error());
        assert!(suspected.is_retryable());

        let bad_request = HotRodError::Server {
            status: 0x84,
            message_id: 2,
            message: "request parsing error".to_string(),
        };
        assert!(bad_request.is_server_error());
        assert!(!bad_request.is_transient_server_error());
        assert!(!bad_request.is_retryable());
    }
}
