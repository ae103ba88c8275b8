use std::io;
use thiserror::Error;

/// Error types for the USK link
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new closed channel error
    pub fn channel_closed(msg: impl Into<String>) -> Self {
        Error::ChannelClosed(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::transport("port vanished");
        assert!(matches!(err, Error::Transport(_)));
        assert_eq!(err.to_string(), "Transport error: port vanished");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "test");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_serial_error_conversion() {
        let serial_err = serialport::Error::new(serialport::ErrorKind::NoDevice, "COM9");
        let err: Error = serial_err.into();
        assert!(matches!(err, Error::Serial(_)));
        assert!(err.to_string().contains("COM9"));
    }
}
