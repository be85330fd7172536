use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::RaftError;

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub node_id: String,
    pub data_dir: PathBuf,
    pub peers: HashMap<String, String>, // node_id -> address
    pub election_timeout_min: u64,      // in milliseconds
    pub election_timeout_max: u64,      // in milliseconds
    pub heartbeat_interval: u64,        // in milliseconds
    pub rpc_timeout: u64,               // in milliseconds
}

impl RaftConfig {
    pub fn new(node_id: &str, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id: node_id.to_string(),
            data_dir: data_dir.into(),
            peers: HashMap::new(),
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            rpc_timeout: 100,
        }
    }

    pub fn add_peer(&mut self, peer_id: &str, address: &str) {
        self.peers.insert(peer_id.to_string(), address.to_string());
    }

    pub fn with_peer(mut self, peer_id: &str, address: &str) -> Self {
        self.add_peer(peer_id, address);
        self
    }

    /// Number of voting members, including this node.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }

    pub fn raft_dir(&self) -> PathBuf {
        self.data_dir.join("raft")
    }

    pub fn validate(&self) -> Result<(), RaftError> {
        if self.node_id.is_empty() {
            return Err(RaftError::InvalidConfig("node id must not be empty".into()));
        }
        if self.peers.contains_key(&self.node_id) {
            return Err(RaftError::InvalidConfig(format!(
                "node {} lists itself as a peer",
                self.node_id
            )));
        }
        if self.election_timeout_min == 0 || self.heartbeat_interval == 0 || self.rpc_timeout == 0 {
            return Err(RaftError::InvalidConfig("timeouts must be non-zero".into()));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::InvalidConfig(format!(
                "election timeout min {}ms exceeds max {}ms",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat interval {}ms must be shorter than the election timeout {}ms",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = RaftConfig::new("n1", "/tmp/n1").with_peer("n2", "127.0.0.1:7002");
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.cluster_size(), 2);
        assert_eq!(cfg.raft_dir(), PathBuf::from("/tmp/n1/raft"));
    }

    #[test]
    fn validate_rejects_self_peer_and_bad_timers() {
        let cfg = RaftConfig::new("n1", "/tmp").with_peer("n1", "127.0.0.1:7001");
        assert!(matches!(cfg.validate(), Err(RaftError::InvalidConfig(_))));

        let mut cfg = RaftConfig::new("n1", "/tmp");
        cfg.election_timeout_min = 400;
        assert!(cfg.validate().is_err());

        let mut cfg = RaftConfig::new("n1", "/tmp");
        cfg.heartbeat_interval = 150;
        assert!(cfg.validate().is_err());

        assert!(RaftConfig::new("", "/tmp").validate().is_err());
    }
}
