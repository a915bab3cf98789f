use thiserror::Error;

/// Result type for SenseME operations
pub type Result<T> = std::result::Result<T, SensemeError>;

/// Errors that can occur when talking to SenseME devices
#[derive(Error, Debug)]
pub enum SensemeError {
    /// Socket level error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Operation did not complete in time
    #[error("Request timeout")]
    Timeout,

    /// Peer closed the connection
    #[error("Connection closed")]
    ConnectionClosed,

    /// Command issued while the device has no live session
    #[error("Device is not connected")]
    NotConnected,

    /// Message could not be framed or split into key and value
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Device answered a command with an `ERROR` reply
    #[error("Device error: {0}")]
    DeviceError(String),

    /// Value rejected before it was sent to the device
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// String could not be parsed as an IP address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// No discovery endpoint could be bound
    #[error("Unable to listen on any interface")]
    NoInterfaces,
}
