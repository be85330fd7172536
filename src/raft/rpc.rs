use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{LogEntry, RaftError};
use crate::network::NetworkError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

impl AppendEntriesArgs {
    /// Index of the last entry this request covers.
    pub fn last_index(&self) -> u64 {
        self.prev_log_index + self.entries.len() as u64
    }
}

/// Reply to [`AppendEntriesArgs`].
///
/// On a log mismatch the follower fills in a hint so the leader can skip a whole
/// term at once: `conflict_term` is the term found at `prev_log_index` (0 if the
/// follower's log is too short) and `conflict_index` is the first index of that
/// term, or the follower's `last_index + 1`. Both are 0 otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
    pub conflict_index: u64,
    pub conflict_term: u64,
}

/// Outbound side of the RPC layer: how a node reaches its peers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        peer: &str,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, NetworkError>;

    async fn append_entries(
        &self,
        peer: &str,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, NetworkError>;
}

/// Inbound side of the RPC layer, implemented by a running node.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle_request_vote(&self, args: RequestVoteArgs)
        -> Result<RequestVoteReply, RaftError>;

    async fn handle_append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RaftError>;
}
