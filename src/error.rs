//! Error types for the voicebridge daemon

use thiserror::Error;

/// Result type alias for voicebridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voicebridge daemon
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Shared-memory ring error
    #[error("ring error: {0}")]
    Ring(String),

    /// WebSocket handshake failure
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Malformed or unsupported WebSocket frame
    #[error("frame error: {0}")]
    Frame(String),

    /// Frame payload exceeds the wire limit
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u64 },

    /// Peer closed the connection
    #[error("connection closed")]
    ConnectionClosed,

    /// Helper process error
    #[error("helper error: {0}")]
    Helper(String),

    /// Helper process is not running
    #[error("helper is not running")]
    HelperNotRunning,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
