use split_net::NetError;
use split_types::wire::ErrorReply;
use split_types::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Net(#[from] NetError),

    /// The scheduler refused to open the session.
    #[error("{0}")]
    Rejected(ErrorReply),

    /// A step failed terminally. `committed` holds the tokens produced
    /// before the failing step.
    #[error("{kind}: {message}")]
    Step { kind: ErrorKind, message: String, committed: Vec<u32> },

    #[error("unexpected {0} reply")]
    Unexpected(&'static str),

    #[error("prompt is empty")]
    EmptyPrompt,
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Net(e) => e.kind(),
            Self::Rejected(reply) => reply.kind,
            Self::Step { kind, .. } => *kind,
            Self::Unexpected(_) => ErrorKind::ProtocolViolation,
            Self::EmptyPrompt => ErrorKind::ProtocolViolation,
        }
    }

    /// Tokens generated before the failure, if any.
    pub fn committed(&self) -> &[u32] {
        match self {
            Self::Step { committed, .. } => committed,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
