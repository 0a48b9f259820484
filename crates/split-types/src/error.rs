// Error taxonomy shared by every crate and carried over the wire.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Wire-level error classification. Every crate-local error maps onto one
/// of these so the orchestrator can surface a stable failure reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Startup only. Fatal.
    ConfigInvalid,
    /// Fatal at startup; after startup only the affected request fails.
    NoDeviceAvailable,
    /// Transient. Retried once against the fallback device.
    DeviceBusy,
    /// Transient once, then session-fatal.
    DeviceExecutionError,
    /// Transient. Retried by the orchestrator.
    TransportTimeout,
    /// Session-fatal, other sessions unaffected.
    ProtocolViolation,
    /// Client error, no session impact.
    SessionNotFound,
    /// A work item deadline elapsed.
    SessionTimedOut,
    /// Step against a session already in a terminal state.
    SessionClosed,
    /// Too many live sessions.
    CapacityExceeded,
}

impl ErrorKind {
    /// Whether the orchestrator may retry the same request.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DeviceBusy | Self::TransportTimeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConfigInvalid        => "ConfigInvalid",
            Self::NoDeviceAvailable    => "NoDeviceAvailable",
            Self::DeviceBusy           => "DeviceBusy",
            Self::DeviceExecutionError => "DeviceExecutionError",
            Self::TransportTimeout     => "TransportTimeout",
            Self::ProtocolViolation    => "ProtocolViolation",
            Self::SessionNotFound      => "SessionNotFound",
            Self::SessionTimedOut      => "SessionTimedOut",
            Self::SessionClosed        => "SessionClosed",
            Self::CapacityExceeded     => "CapacityExceeded",
        };
        f.write_str(name)
    }
}

/// Configuration loading and validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config '{path}': {detail}")]
    Read { path: String, detail: String },

    #[error("TOML parse error: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ConfigInvalid
    }
}
