use std::sync::Arc;
use std::time::Duration;

use super::{now_ms, KvCommand, KvOutcome, KvStore, StoreError};
use crate::raft::Raft;

/// Client-facing key-value API on top of a Raft node.
///
/// Writes go through the log and return once applied locally. Reads are served
/// from this node's state machine and may lag the leader.
pub struct ReplicatedStore {
    raft: Arc<Raft<KvStore>>,
    write_timeout: Duration,
}

impl ReplicatedStore {
    pub fn new(raft: Arc<Raft<KvStore>>, write_timeout: Duration) -> Self {
        Self { raft, write_timeout }
    }

    pub fn raft(&self) -> &Arc<Raft<KvStore>> {
        &self.raft
    }

    /// Sets `key`. A `ttl` of `None` or zero means the key never expires.
    pub async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<KvOutcome, StoreError> {
        let expires_at_ms = ttl
            .filter(|ttl| !ttl.is_zero())
            .map(|ttl| now_ms().saturating_add(ttl.as_millis() as u64));

        self.submit(KvCommand::Set {
            key: key.to_string(),
            value: value.to_string(),
            expires_at_ms,
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<KvOutcome, StoreError> {
        self.submit(KvCommand::Delete {
            key: key.to_string(),
        })
        .await
    }

    pub fn get(&self, key: &str) -> Result<String, StoreError> {
        self.raft.state_machine().get(key)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.raft.state_machine().exists(key)
    }

    async fn submit(&self, command: KvCommand) -> Result<KvOutcome, StoreError> {
        let encoded = command.encode()?;
        match self.raft.propose_and_wait(encoded, self.write_timeout).await? {
            KvOutcome::Rejected(reason) => Err(StoreError::Rejected(reason)),
            outcome => Ok(outcome),
        }
    }
}
