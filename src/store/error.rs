use thiserror::Error;

use crate::raft::RaftError;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Key expired: {0}")]
    KeyExpired(String),

    #[error("Command rejected: {0}")]
    Rejected(String),

    #[error("Codec error: {0}")]
    CodecError(String),

    #[error("Raft error: {0}")]
    RaftError(#[from] RaftError),
}
