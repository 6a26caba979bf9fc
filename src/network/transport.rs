use async_trait::async_trait;
use tokio::net::TcpStream;

use super::codec::{read_frame, write_frame};
use crate::config::Server;
use crate::raft::rpc::RaftMessage;
use crate::util::errors::{RaftError, Result};

/// Outbound half of the RPC layer: deliver one request to a peer and
/// return its response. Callers bound each call with their own timeout.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, target: &Server, message: RaftMessage) -> Result<RaftMessage>;
}

/// TCP transport, one connection per call, length-prefixed bincode frames
#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, target: &Server, message: RaftMessage) -> Result<RaftMessage> {
        let address = target.address();
        let mut stream = TcpStream::connect(&address)
            .await
            .map_err(|e| RaftError::NetworkError(format!("connect {}: {}", address, e)))?;
        stream.set_nodelay(true)?;

        write_frame(&mut stream, &message).await?;

        match read_frame::<_, RaftMessage>(&mut stream).await? {
            Some(response) => Ok(response),
            None => Err(RaftError::NetworkError(format!(
                "{} closed the connection without replying to {}",
                address,
                message.kind()
            ))),
        }
    }
}
