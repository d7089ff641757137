//! Error types for the relay client

use thiserror::Error;

/// Main error type for the client
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Playback error: {0}")]
    Playback(#[from] PlaybackError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Failures while establishing the relay connection
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Connection closed during handshake")]
    ClosedDuringHandshake,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Outbound send failures. None of these are fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Not connected")]
    NotConnected,

    #[error("Outbound queue full")]
    QueueFull,
}

/// Stream-level transport failures
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Transport closed")]
    Closed,
}

/// One inbound record that could not be parsed.
///
/// Carried inside decode results instead of being raised, so sibling
/// records in the same read are still processed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed record {segment:?}: {reason}")]
pub struct ParseError {
    /// The raw segment as received (without separator)
    pub segment: String,
    /// Why it was rejected
    pub reason: String,
}

impl ParseError {
    pub fn new(segment: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            segment: segment.into(),
            reason: reason.to_string(),
        }
    }
}

/// Capture device errors
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Capture already running")]
    AlreadyRunning,

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),
}

/// Playback device errors
#[derive(Error, Debug)]
pub enum PlaybackError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Output device did not start in time")]
    Timeout,
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("No configuration directory available")]
    NoConfigDir,
}

/// Result type alias for the client
pub type Result<T> = std::result::Result<T, Error>;
