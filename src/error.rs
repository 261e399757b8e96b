//! Error types and handling.

use thiserror::Error;

/// Library-wide error type
#[derive(Error, Debug)]
pub enum FritzError {
    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Device authentication failed
    #[error("Device login failed: {0}")]
    LoginFailed(String),

    /// Device communication timeout
    #[error("Device timeout: {0}")]
    Timeout(String),

    /// Data parsing error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// File or socket I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TCP connection failed or was closed by the device
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Unexpected data on the call monitor or in a device page
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Page or record not found
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Result type alias for FritzError
pub type Result<T> = std::result::Result<T, FritzError>;

impl FritzError {
    /// Create a parse error with message
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a config error with message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a protocol error with message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a not found error with message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Whether repeating the request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::Io(_) | Self::Connection(_) | Self::Timeout(_)
        )
    }
}
