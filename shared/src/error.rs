/*!
Common error types for the Hantek bridge components.
*/

use thiserror::Error;

/// Common result type used throughout the shared library
pub type Result<T> = std::result::Result<T, ScopeError>;

/// Failures of the USB link to the instrument
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Endpoint stall (errno 32). Expected on some reset/calibration requests.
    #[error("USB pipe error (endpoint stalled)")]
    Pipe,

    #[error("USB transfer timed out")]
    Timeout,

    #[error("USB device disconnected")]
    Disconnected,

    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("USB transfer failed: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether this error is the documented stall that some vendor requests
    /// return instead of data
    pub fn is_ignorable_stall(&self) -> bool {
        matches!(self, Self::Pipe)
    }
}

/// Comprehensive error type for all bridge operations
#[derive(Error, Debug)]
pub enum ScopeError {
    /// USB control/bulk I/O failures
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed control command
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Setting outside the supported range
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Short, empty or otherwise unusable capture
    #[error("Capture error: {0}")]
    Capture(String),

    /// Socket I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScopeError {
    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new capture error
    pub fn capture(msg: impl Into<String>) -> Self {
        Self::Capture(msg.into())
    }

    /// Whether the error ends a streaming session
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Capture(_) | Self::Io(_))
    }
}
