use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use log::{debug, error, info, warn};

use super::codec::{read_frame, write_frame, RpcRequest, RpcResponse};
use super::NetworkError;
use crate::raft::RpcHandler;

/// Accepts peer connections and hands their requests to a local node.
pub struct RaftServer {
    handler: Arc<dyn RpcHandler>,
}

impl RaftServer {
    pub fn new(handler: Arc<dyn RpcHandler>) -> Self {
        Self { handler }
    }

    /// Serves connections from `listener` until `shutdown` turns true.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), NetworkError> {
        info!("Raft RPC server listening on {}", listener.local_addr()?);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!("Accepted peer connection from {}", remote);
                        let handler = Arc::clone(&self.handler);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(handler, stream, shutdown).await {
                                debug!("Peer connection from {} closed: {}", remote, e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept peer connection: {}", e),
                },
            }
        }

        info!("Raft RPC server stopped");
        Ok(())
    }
}

/// Serves one peer connection until the peer hangs up or the server shuts down.
async fn handle_connection(
    handler: Arc<dyn RpcHandler>,
    mut stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), NetworkError> {
    stream.set_nodelay(true)?;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let request = tokio::select! {
            _ = shutdown.changed() => break,
            request = read_frame::<_, RpcRequest>(&mut stream) => match request? {
                Some(request) => request,
                None => break,
            },
        };
        let response = dispatch(handler.as_ref(), request).await;
        write_frame(&mut stream, &response).await?;
    }

    Ok(())
}

async fn dispatch(handler: &dyn RpcHandler, request: RpcRequest) -> RpcResponse {
    match request {
        RpcRequest::RequestVote(args) => {
            debug!("Received RequestVote: {:?}", args);
            match handler.handle_request_vote(args).await {
                Ok(reply) => RpcResponse::RequestVote(reply),
                Err(e) => {
                    warn!("Error handling RequestVote: {}", e);
                    RpcResponse::Error(e.to_string())
                }
            }
        }
        RpcRequest::AppendEntries(args) => {
            debug!(
                "Received AppendEntries: term={}, leader={}, entries={}",
                args.term,
                args.leader_id,
                args.entries.len()
            );
            match handler.handle_append_entries(args).await {
                Ok(reply) => RpcResponse::AppendEntries(reply),
                Err(e) => {
                    warn!("Error handling AppendEntries: {}", e);
                    RpcResponse::Error(e.to_string())
                }
            }
        }
    }
}
