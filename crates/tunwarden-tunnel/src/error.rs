//! Tunnel service error types

use crate::driver::DriverError;
use std::io;
use thiserror::Error;
use tunwarden_protocol::{CodecError, ConfigError};

/// Result type for tunnel operations
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Errors that can occur while driving the tunnel
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Submitted configuration text did not parse
    #[error("Malformed config: {0}")]
    MalformedConfig(#[from] ConfigError),

    /// Driver state could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Driver refused an adapter operation
    #[error("Adapter error: {0}")]
    Adapter(#[from] DriverError),

    /// Driver refused the pushed configuration bytes
    #[error("Configuration rejected: {0}")]
    ConfigurationRejected(DriverError),

    /// A route, address, DNS or forwarding change failed
    #[error("Route error: {0}")]
    Route(String),

    /// IPC request could not be read or understood
    #[error("Channel error: {0}")]
    Channel(String),

    /// A session is already connecting or connected
    #[error("Session already active")]
    AlreadyActive,

    /// A bounded driver or OS call did not finish in time
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Service configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Platform not supported
    #[error("Platform not supported: {0}")]
    PlatformNotSupported(String),

    /// The supervisor task has exited
    #[error("Service stopped")]
    ServiceStopped,
}

impl TunnelError {
    /// Whether the error means the adapter itself is gone or unusable, as
    /// opposed to a transient failure of one call
    pub fn is_fatal(&self) -> bool {
        matches!(self, TunnelError::Adapter(_) | TunnelError::ServiceStopped)
    }
}
