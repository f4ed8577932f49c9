//! Error types for the bridge engine

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while starting or stopping the bridge
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse the TOML bridge configuration
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// A configuration file could not be read
    #[error("failed to read {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An engine configuration file is not valid JSON
    #[error("failed to parse {}: {source}", path.display())]
    JsonParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Virtual interface error
    #[error("TUN error: {0}")]
    Tun(#[from] t2s_tun::Error),

    /// The virtual interface could not be opened
    #[error("failed to open tun device: {0}")]
    DeviceOpenFailed(#[source] t2s_tun::Error),

    /// Malformed proxy or API address
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The userspace stack was used before it was fully wired
    #[error("stack not ready: {0}")]
    StackNotReady(&'static str),

    /// SOCKS negotiation with the downstream proxy failed
    #[error("SOCKS error: {0}")]
    Socks(String),

    /// A proxy engine failed to launch or run
    #[error("engine error: {0}")]
    Engine(String),

    /// Already running
    #[error("already running")]
    AlreadyRunning,

    /// Not running
    #[error("not running")]
    NotRunning,

    /// Releasing a resource failed; the host decides whether this is fatal
    #[error("close failed: {0}")]
    CloseFailed(String),
}

impl Error {
    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::ConfigParse(_)
                | Error::ConfigRead { .. }
                | Error::JsonParse { .. }
                | Error::InvalidAddress(_)
                | Error::Tun(
                    t2s_tun::Error::Config(_)
                        | t2s_tun::Error::InvalidAddress(_)
                        | t2s_tun::Error::InvalidNetmask(_)
                )
        )
    }

    /// Check if the requested state was already in effect
    ///
    /// Callers log these and carry on; they are not escalated.
    pub fn is_noop(&self) -> bool {
        matches!(self, Error::AlreadyRunning | Error::NotRunning)
    }

    /// Check if this error leaves host state (routing, interfaces) uncertain
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::CloseFailed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::AlreadyRunning.is_noop());
        assert!(Error::NotRunning.is_noop());
        assert!(!Error::AlreadyRunning.is_fatal());

        assert!(Error::CloseFailed("busy".into()).is_fatal());
        assert!(Error::InvalidAddress("x".into()).is_config_error());

        let json = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = Error::JsonParse {
            path: PathBuf::from("/etc/snell.json"),
            source: json,
        };
        assert!(err.is_config_error());
        assert!(err.to_string().starts_with("failed to parse /etc/snell.json"));
    }
}
