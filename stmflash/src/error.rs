//! Error types for stmflash.

use std::io;
use thiserror::Error;

/// Result type for stmflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for stmflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The negotiated command map marks this command as unsupported.
    #[error("{0} command not implemented in this bootloader")]
    NoCommand(&'static str),

    /// The device replied NACK.
    #[error("device refused: {0}")]
    Nack(String),

    /// A transport deadline elapsed without the expected bytes.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Unexpected byte, checksum mismatch, desync or transport failure.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The product ID is not in the device catalog.
    #[error("unknown/unsupported device (PID 0x{0:03x})")]
    UnknownDevice(u16),
}

impl Error {
    /// Whether this error is a transport read timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}
