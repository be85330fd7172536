// Consensus core
pub mod raft;

// Peer transport and the replicated key-value store built on top
pub mod config;
pub mod network;
pub mod store;

// Public exports
pub use config::Config;
pub use raft::{Raft, RaftConfig, RaftError, StateMachine};
pub use store::{KvStore, ReplicatedStore};
