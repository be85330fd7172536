//! Wire format for peer RPCs.
//!
//! Each message is a frame of a 4-byte big-endian length followed by that many
//! bytes of bincode. A connection carries one request and its response at a time.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::NetworkError;
use crate::raft::{AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply};

pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponse {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
    Error(String),
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), NetworkError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serde::encode_to_vec(message, bincode::config::standard())
        .map_err(|e| NetworkError::CodecError(e.to_string()))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(NetworkError::FrameTooLarge(payload.len()));
    }

    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. Returns `None` if the peer closed the connection between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, NetworkError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(NetworkError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let (message, _) = bincode::serde::decode_from_slice(&payload, bincode::config::standard())
        .map_err(|e| NetworkError::CodecError(e.to_string()))?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::LogEntry;

    #[tokio::test]
    async fn frames_survive_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let request = RpcRequest::AppendEntries(AppendEntriesArgs {
            term: 3,
            leader_id: "n1".to_string(),
            prev_log_index: 4,
            prev_log_term: 2,
            entries: vec![LogEntry::new(5, 3, b"set a 1".to_vec())],
            leader_commit: 4,
        });

        write_frame(&mut client, &request).await.expect("write");
        write_frame(&mut client, &RpcResponse::Error("nope".to_string()))
            .await
            .expect("write");
        drop(client);

        let first: Option<RpcRequest> = read_frame(&mut server).await.expect("read");
        assert_eq!(first, Some(request));
        let second: Option<RpcResponse> = read_frame(&mut server).await.expect("read");
        assert_eq!(second, Some(RpcResponse::Error("nope".to_string())));
        let end: Option<RpcResponse> = read_frame(&mut server).await.expect("read");
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn oversized_frame_is_refused() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes())
            .await
            .expect("write");

        let result: Result<Option<RpcRequest>, _> = read_frame(&mut server).await;
        assert!(matches!(result, Err(NetworkError::FrameTooLarge(_))));
    }
}
