//! Error types for t2s-tun

use std::io;
use thiserror::Error;

/// Result type alias for t2s-tun operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during virtual interface operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// The device could not be opened with the given parameter set
    #[error("failed to open tun device {params}: {reason}")]
    OpenFailed { params: String, reason: String },

    /// Device not found
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Invalid IP address
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Netmask is not a contiguous run of ones
    #[error("invalid netmask: {0}")]
    InvalidNetmask(String),

    /// The device was closed while an operation was pending
    #[error("tun device closed")]
    Closed,

    /// `close()` was called on a device that is already closed
    #[error("tun device already closed")]
    AlreadyClosed,
}

impl Error {
    /// Check if the error is a permission-related error
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == io::ErrorKind::PermissionDenied,
            Error::OpenFailed { reason, .. } => reason.contains("ermission denied"),
            _ => false,
        }
    }

    /// Check if the error means the device is gone
    ///
    /// The relay loop treats this as the normal end of a session rather
    /// than a failure.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed | Error::AlreadyClosed)
    }
}
