//! Domain error types

use thiserror::Error;

/// Errors that can occur while driving a serial channel
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Channel has not been initialized")]
    NotInitialized,

    #[error("Channel is already initialized")]
    AlreadyInitialized,

    #[error("Channel has been disposed")]
    Disposed,

    #[error("Serial port {0} is not open")]
    NotOpen(String),

    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;
