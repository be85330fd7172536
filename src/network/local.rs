use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::NetworkError;
use crate::raft::{
    AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply, RpcHandler,
    Transport,
};

/// In-process network for running several nodes in one runtime.
///
/// Calls go straight to the target's [`RpcHandler`]. A node can be cut off with
/// [`LocalNetwork::isolate`]: every call to or from it then fails as unreachable
/// until it is healed.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<HashMap<String, Arc<dyn RpcHandler>>>,
    isolated: RwLock<HashSet<String>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, id: &str, handler: Arc<dyn RpcHandler>) {
        self.nodes.write().await.insert(id.to_string(), handler);
    }

    pub async fn unregister(&self, id: &str) {
        self.nodes.write().await.remove(id);
    }

    pub async fn isolate(&self, id: &str) {
        self.isolated.write().await.insert(id.to_string());
    }

    pub async fn heal(&self, id: &str) {
        self.isolated.write().await.remove(id);
    }

    /// Transport for the node `from` to reach its peers through this network.
    pub fn transport(self: &Arc<Self>, from: &str) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            network: Arc::clone(self),
            from: from.to_string(),
        })
    }

    async fn route(&self, from: &str, to: &str) -> Result<Arc<dyn RpcHandler>, NetworkError> {
        {
            let isolated = self.isolated.read().await;
            if isolated.contains(from) || isolated.contains(to) {
                return Err(NetworkError::Unreachable(to.to_string()));
            }
        }
        self.nodes
            .read()
            .await
            .get(to)
            .cloned()
            .ok_or_else(|| NetworkError::Unreachable(to.to_string()))
    }
}

struct LocalTransport {
    network: Arc<LocalNetwork>,
    from: String,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request_vote(
        &self,
        peer: &str,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, NetworkError> {
        let handler = self.network.route(&self.from, peer).await?;
        let reply = handler
            .handle_request_vote(args)
            .await
            .map_err(|e| NetworkError::Remote(e.to_string()))?;
        // The link may have been cut while the request was being handled
        self.network.route(peer, &self.from).await?;
        Ok(reply)
    }

    async fn append_entries(
        &self,
        peer: &str,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, NetworkError> {
        let handler = self.network.route(&self.from, peer).await?;
        let reply = handler
            .handle_append_entries(args)
            .await
            .map_err(|e| NetworkError::Remote(e.to_string()))?;
        self.network.route(peer, &self.from).await?;
        Ok(reply)
    }
}
