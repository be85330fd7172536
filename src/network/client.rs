use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use log::debug;

use super::codec::{read_frame, write_frame, RpcRequest, RpcResponse};
use super::NetworkError;
use crate::raft::{
    AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply, Transport,
};

/// Connection to one peer's RPC server.
///
/// The TCP stream is opened lazily and reused. It is dropped whenever a call
/// fails or is cancelled part way, so a half-read response can never be taken
/// for the answer to the next request.
pub struct RaftClient {
    address: String,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl RaftClient {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            connect_timeout: Duration::from_secs(5),
            stream: None,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn connect(&mut self) -> Result<(), NetworkError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| NetworkError::TimeoutError)?
            .map_err(|e| NetworkError::ConnectionError(format!("{}: {e}", self.address)))?;
        stream.set_nodelay(true)?;

        debug!("Connected to peer at {}", self.address);
        self.stream = Some(stream);

        Ok(())
    }

    async fn call(&mut self, request: &RpcRequest) -> Result<RpcResponse, NetworkError> {
        if self.stream.is_none() {
            self.connect().await?;
        }
        // Held outside `self` for the duration of the call
        let mut stream = self
            .stream
            .take()
            .ok_or_else(|| NetworkError::ConnectionError("Client not connected".to_string()))?;

        write_frame(&mut stream, request).await?;
        let response: RpcResponse = read_frame(&mut stream).await?.ok_or_else(|| {
            NetworkError::ConnectionError(format!("{} closed the connection", self.address))
        })?;

        self.stream = Some(stream);
        Ok(response)
    }

    pub async fn request_vote(
        &mut self,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, NetworkError> {
        match self.call(&RpcRequest::RequestVote(args)).await? {
            RpcResponse::RequestVote(reply) => Ok(reply),
            RpcResponse::Error(message) => Err(NetworkError::Remote(message)),
            other => Err(NetworkError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    pub async fn append_entries(
        &mut self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, NetworkError> {
        match self.call(&RpcRequest::AppendEntries(args)).await? {
            RpcResponse::AppendEntries(reply) => Ok(reply),
            RpcResponse::Error(message) => Err(NetworkError::Remote(message)),
            other => Err(NetworkError::UnexpectedResponse(format!("{other:?}"))),
        }
    }
}

/// [`Transport`] over TCP with one cached connection per peer.
pub struct TcpTransport {
    clients: HashMap<String, Mutex<RaftClient>>,
}

impl TcpTransport {
    /// `peers` maps node ids to `host:port` addresses.
    pub fn new(peers: &HashMap<String, String>, connect_timeout: Duration) -> Self {
        let clients = peers
            .iter()
            .map(|(id, address)| {
                let client = RaftClient::new(address).with_connect_timeout(connect_timeout);
                (id.clone(), Mutex::new(client))
            })
            .collect();
        Self { clients }
    }

    fn client(&self, peer: &str) -> Result<&Mutex<RaftClient>, NetworkError> {
        self.clients
            .get(peer)
            .ok_or_else(|| NetworkError::UnknownPeer(peer.to_string()))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request_vote(
        &self,
        peer: &str,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, NetworkError> {
        self.client(peer)?.lock().await.request_vote(args).await
    }

    async fn append_entries(
        &self,
        peer: &str,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, NetworkError> {
        self.client(peer)?.lock().await.append_entries(args).await
    }
}
