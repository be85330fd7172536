use thiserror::Error;

use crate::network::NetworkError;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Log index {index} out of range [{first}, {last}]")]
    OutOfRange { index: u64, first: u64, last: u64 },

    #[error("Log append expected index {expected}, got {actual}")]
    IndexConflict { expected: u64, actual: u64 },

    #[error("Cannot truncate committed entry {index} (commit index {commit_index})")]
    CommittedTruncation { index: u64, commit_index: u64 },

    #[error("Not a leader (leader hint: {0:?})")]
    NotLeader(Option<String>),

    #[error("Stale term: {0}")]
    StaleTerm(u64),

    #[error("Proposal at index {index} was superseded before it applied")]
    ProposalDropped { index: u64 },

    #[error("Node is not running")]
    NotRunning,

    #[error("Timeout")]
    Timeout,

    #[error("Network error: {0}")]
    NetworkError(#[from] NetworkError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Corrupt durable state: {0}")]
    Corrupt(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RaftError {
    /// Errors a caller can recover from by retrying, possibly against another node.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaftError::NotLeader(_)
                | RaftError::ProposalDropped { .. }
                | RaftError::Timeout
                | RaftError::NetworkError(_)
        )
    }
}
