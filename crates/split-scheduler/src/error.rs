use split_types::{ConfigError, DeviceId, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),

    #[error("no device available: {0}")]
    NoDeviceAvailable(String),

    #[error("device {0} is busy")]
    DeviceBusy(DeviceId),

    #[error("execution failed on {device}: {detail}")]
    Execution { device: DeviceId, detail: String },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("unknown session: {0}")]
    SessionNotFound(String),

    #[error("session {session_id} timed out at layer {layer}")]
    TimedOut { session_id: String, layer: u32 },

    #[error("session {session_id} is {phase}")]
    SessionClosed { session_id: String, phase: String },

    #[error("session limit reached ({0})")]
    CapacityExceeded(u32),
}

impl SchedulerError {
    /// Wire classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_)            => ErrorKind::ConfigInvalid,
            Self::NoDeviceAvailable(_) => ErrorKind::NoDeviceAvailable,
            Self::DeviceBusy(_)        => ErrorKind::DeviceBusy,
            Self::Execution { .. }     => ErrorKind::DeviceExecutionError,
            Self::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            Self::SessionNotFound(_)   => ErrorKind::SessionNotFound,
            Self::TimedOut { .. }      => ErrorKind::SessionTimedOut,
            Self::SessionClosed { .. } => ErrorKind::SessionClosed,
            Self::CapacityExceeded(_)  => ErrorKind::CapacityExceeded,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, SchedulerError>;
