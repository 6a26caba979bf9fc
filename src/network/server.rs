use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::codec::{read_frame, write_frame};
use crate::raft::node::RaftNode;
use crate::raft::rpc::RaftMessage;
use crate::util::errors::Result;

/// Accept peer connections until `shutdown` is cancelled. Each connection
/// gets its own task and may carry any number of request/response pairs.
pub async fn serve(
    listener: TcpListener,
    node: Arc<RaftNode>,
    shutdown: CancellationToken,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    tracing::info!(node_id = node.id(), %local_addr, "RPC server listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote)) => {
                        let node = node.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = shutdown.cancelled() => {}
                                _ = handle_connection(stream, remote, node) => {}
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(
                            node_id = node.id(),
                            error = %e,
                            "Failed to accept connection"
                        );
                    }
                }
            }
        }
    }

    tracing::info!(node_id = node.id(), "RPC server stopped");
    Ok(())
}

async fn handle_connection(mut stream: TcpStream, remote: SocketAddr, node: Arc<RaftNode>) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%remote, error = %e, "Could not set TCP_NODELAY");
    }

    loop {
        let request: RaftMessage = match read_frame(&mut stream).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(%remote, error = %e, "Dropping connection after bad frame");
                break;
            }
        };

        let kind = request.kind();
        let response = match node.handle_message(request).await {
            Ok(response) => response,
            Err(e) => {
                // No reply; the caller sees a closed connection
                tracing::error!(
                    node_id = node.id(),
                    %remote,
                    error = %e,
                    "Failed to handle {}",
                    kind
                );
                break;
            }
        };

        if let Err(e) = write_frame(&mut stream, &response).await {
            tracing::warn!(%remote, error = %e, "Failed to write response");
            break;
        }
    }
}
