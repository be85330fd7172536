//! Replicated key-value state machine with optional per-key expiry.

mod error;
mod replicated;

pub use self::error::StoreError;
pub use self::replicated::ReplicatedStore;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use log::{debug, warn};

use crate::raft::StateMachine;

/// Commands carried in the Raft log.
///
/// Expiry is an absolute wall-clock time chosen by the proposer, so every replica
/// stores the same deadline no matter when it applies the command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Set {
        key: String,
        value: String,
        expires_at_ms: Option<u64>,
    },
    Delete {
        key: String,
    },
}

impl KvCommand {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::CodecError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (command, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::CodecError(e.to_string()))?;
        Ok(command)
    }
}

/// Result of applying one [`KvCommand`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOutcome {
    Set { replaced: bool },
    Deleted { existed: bool },
    /// The log entry did not decode as a command. Every replica skips it alike.
    Rejected(String),
}

#[derive(Debug, Clone)]
struct Item {
    value: String,
    expires_at_ms: Option<u64>,
}

impl Item {
    fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expires_at_ms, Some(at) if at <= now_ms)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Default)]
pub struct KvStore {
    data: RwLock<HashMap<String, Item>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Result<String, StoreError> {
        self.get_at(key, now_ms())
    }

    /// Reads `key` as of `now_ms`. An expired key is removed on the way out.
    pub fn get_at(&self, key: &str, now_ms: u64) -> Result<String, StoreError> {
        {
            let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
            match data.get(key) {
                None => return Err(StoreError::KeyNotFound(key.to_string())),
                Some(item) if !item.is_expired(now_ms) => return Ok(item.value.clone()),
                Some(_) => {}
            }
        }

        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        if data.get(key).is_some_and(|item| item.is_expired(now_ms)) {
            data.remove(key);
        }
        Err(StoreError::KeyExpired(key.to_string()))
    }

    pub fn exists(&self, key: &str) -> bool {
        let now = now_ms();
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(|item| !item.is_expired(now))
    }

    /// Number of stored keys, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every key whose deadline is at or before `now_ms`.
    pub fn purge_expired(&self, now_ms: u64) -> usize {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        let before = data.len();
        data.retain(|_, item| !item.is_expired(now_ms));
        let purged = before - data.len();
        if purged > 0 {
            debug!("Purged {} expired keys", purged);
        }
        purged
    }
}

impl StateMachine for KvStore {
    type Output = KvOutcome;

    fn apply(&self, command: &[u8]) -> KvOutcome {
        let command = match KvCommand::decode(command) {
            Ok(command) => command,
            Err(e) => {
                warn!("Skipping undecodable log entry: {}", e);
                return KvOutcome::Rejected(e.to_string());
            }
        };

        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        match command {
            KvCommand::Set {
                key,
                value,
                expires_at_ms,
            } => {
                let replaced = data.insert(key, Item { value, expires_at_ms }).is_some();
                KvOutcome::Set { replaced }
            }
            KvCommand::Delete { key } => KvOutcome::Deleted {
                existed: data.remove(&key).is_some(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(key: &str, value: &str, expires_at_ms: Option<u64>) -> Vec<u8> {
        KvCommand::Set {
            key: key.to_string(),
            value: value.to_string(),
            expires_at_ms,
        }
        .encode()
        .expect("encode")
    }

    fn delete(key: &str) -> Vec<u8> {
        KvCommand::Delete { key: key.to_string() }.encode().expect("encode")
    }

    #[test]
    fn apply_set_and_delete() {
        let store = KvStore::new();

        assert_eq!(store.apply(&set("a", "1", None)), KvOutcome::Set { replaced: false });
        assert_eq!(store.apply(&set("a", "2", None)), KvOutcome::Set { replaced: true });
        assert_eq!(store.get("a").expect("get"), "2");
        assert!(store.exists("a"));

        assert_eq!(store.apply(&delete("a")), KvOutcome::Deleted { existed: true });
        assert_eq!(store.apply(&delete("a")), KvOutcome::Deleted { existed: false });
        assert!(matches!(store.get("a"), Err(StoreError::KeyNotFound(_))));
    }

    #[test]
    fn undecodable_command_is_rejected_without_side_effects() {
        let store = KvStore::new();
        assert!(matches!(store.apply(&[0xff, 0xff, 0xff, 0xff]), KvOutcome::Rejected(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn expired_keys_are_hidden_and_dropped_on_read() {
        let store = KvStore::new();
        store.apply(&set("session", "abc", Some(1_000)));

        assert_eq!(store.get_at("session", 999).expect("live"), "abc");
        assert!(matches!(store.get_at("session", 1_000), Err(StoreError::KeyExpired(_))));
        assert!(matches!(store.get_at("session", 1_001), Err(StoreError::KeyNotFound(_))));
    }

    #[test]
    fn purge_removes_only_expired_keys() {
        let store = KvStore::new();
        store.apply(&set("old", "x", Some(10)));
        store.apply(&set("new", "y", Some(10_000)));
        store.apply(&set("forever", "z", None));

        assert_eq!(store.purge_expired(500), 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.purge_expired(500), 0);
        assert_eq!(store.get_at("forever", u64::MAX).expect("get"), "z");
    }

    #[test]
    fn same_commands_give_same_state() {
        let commands = vec![
            set("a", "1", None),
            set("b", "2", Some(50)),
            delete("a"),
            set("c", "3", None),
        ];
        let left = KvStore::new();
        let right = KvStore::new();
        for command in &commands {
            assert_eq!(left.apply(command), right.apply(command));
        }
        assert_eq!(left.len(), right.len());
        assert_eq!(left.get_at("c", 0).expect("c"), right.get_at("c", 0).expect("c"));
    }
}
