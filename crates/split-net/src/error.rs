use std::time::Duration;

use split_types::wire::ErrorReply;
use split_types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("invalid endpoint: {0}")]
    Endpoint(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("connection closed")]
    Closed,

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("unexpected {0} reply")]
    Unexpected(&'static str),

    /// The scheduler answered with an error reply.
    #[error("{0}")]
    Remote(ErrorReply),
}

impl NetError {
    /// Wire classification. Lost connections are reported as transport
    /// timeouts: the request's outcome is unknown either way.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Endpoint(_) => ErrorKind::ConfigInvalid,
            Self::FrameTooLarge { .. }
            | Self::Decode(_)
            | Self::Encode(_)
            | Self::Unexpected(_) => ErrorKind::ProtocolViolation,
            Self::Io(_) | Self::Closed | Self::Timeout(_) => ErrorKind::TransportTimeout,
            Self::Remote(reply) => reply.kind,
        }
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
