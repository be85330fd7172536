use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::raft::RaftConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid peer entry '{0}', expected id=host:port")]
    InvalidPeer(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Process configuration for one `raftkv` node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node_id: String,
    pub address: String,
    pub data_dir: PathBuf,
    pub peers: Vec<PeerConfig>,
    pub timing: TimingConfig,
    pub ttl_purge_interval_secs: u64,
    pub write_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub rpc_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            rpc_timeout_ms: 100,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            address: "127.0.0.1:8000".to_string(),
            data_dir: PathBuf::from("data"),
            peers: vec![],
            timing: TimingConfig::default(),
            ttl_purge_interval_secs: 60,
            write_timeout_ms: 5_000,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Parses a peer list of the form `id=host:port,id=host:port`.
    pub fn parse_peers(list: &str) -> Result<Vec<PeerConfig>, ConfigError> {
        list.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once('=') {
                Some((id, address)) if !id.is_empty() && !address.is_empty() => Ok(PeerConfig {
                    id: id.trim().to_string(),
                    address: address.trim().to_string(),
                }),
                _ => Err(ConfigError::InvalidPeer(part.to_string())),
            })
            .collect()
    }

    /// Directory holding this node's durable state.
    pub fn node_data_dir(&self) -> PathBuf {
        self.data_dir.join(&self.node_id)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn ttl_purge_interval(&self) -> Duration {
        Duration::from_secs(self.ttl_purge_interval_secs)
    }

    /// Builds the consensus configuration. A peer entry naming this node is
    /// skipped so every node can share one cluster-wide peer list.
    pub fn to_raft_config(&self) -> Result<RaftConfig, ConfigError> {
        if self.node_id.is_empty() {
            return Err(ConfigError::Invalid("node id is required".to_string()));
        }

        let mut raft = RaftConfig::new(&self.node_id, self.node_data_dir());
        for peer in self.peers.iter().filter(|p| p.id != self.node_id) {
            raft.add_peer(&peer.id, &peer.address);
        }
        raft.election_timeout_min = self.timing.election_timeout_min_ms;
        raft.election_timeout_max = self.timing.election_timeout_max_ms;
        raft.heartbeat_interval = self.timing.heartbeat_interval_ms;
        raft.rpc_timeout = self.timing.rpc_timeout_ms;

        raft.validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(raft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn config_default_values_are_sensible() {
        let cfg = Config::default();
        assert_eq!(cfg.address, "127.0.0.1:8000");
        assert!(cfg.peers.is_empty());
        assert_eq!(cfg.timing.election_timeout_min_ms, 150);
        assert_eq!(cfg.timing.heartbeat_interval_ms, 50);
        assert_eq!(cfg.write_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn parse_peers_accepts_list_and_rejects_garbage() {
        let peers = Config::parse_peers("n2=127.0.0.1:8002, n3=127.0.0.1:8003,").expect("parse");
        assert_eq!(
            peers,
            vec![
                PeerConfig { id: "n2".into(), address: "127.0.0.1:8002".into() },
                PeerConfig { id: "n3".into(), address: "127.0.0.1:8003".into() },
            ]
        );

        assert!(matches!(Config::parse_peers("n2"), Err(ConfigError::InvalidPeer(_))));
        assert!(matches!(Config::parse_peers("=addr"), Err(ConfigError::InvalidPeer(_))));
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let mut file = NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"{{"node_id": "n1", "peers": [{{"id": "n2", "address": "10.0.0.2:8000"}}],
                "timing": {{"heartbeat_interval_ms": 20}}}}"#
        )
        .expect("write");

        let cfg = Config::from_file(file.path()).expect("load");
        assert_eq!(cfg.node_id, "n1");
        assert_eq!(cfg.timing.heartbeat_interval_ms, 20);
        assert_eq!(cfg.timing.election_timeout_max_ms, 300);
        assert_eq!(cfg.ttl_purge_interval_secs, 60);
    }

    #[test]
    fn raft_config_skips_self_and_validates() {
        let cfg = Config {
            node_id: "n1".into(),
            peers: Config::parse_peers("n1=a:1,n2=b:2,n3=c:3").expect("parse"),
            ..Config::default()
        };
        let raft = cfg.to_raft_config().expect("raft config");
        assert_eq!(raft.cluster_size(), 3);
        assert!(!raft.peers.contains_key("n1"));
        assert_eq!(raft.data_dir, PathBuf::from("data").join("n1"));

        let mut bad = cfg.clone();
        bad.timing.heartbeat_interval_ms = 500;
        assert!(matches!(bad.to_raft_config(), Err(ConfigError::Invalid(_))));

        assert!(Config::default().to_raft_config().is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Config::from_file("/nonexistent/raftkv.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
