use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::transport::Transport;
use crate::config::Server;
use crate::raft::node::RaftNode;
use crate::raft::rpc::RaftMessage;
use crate::util::errors::{RaftError, Result};

/// In-process network for running whole clusters inside one runtime.
/// Nodes are addressed by their configured `ip:port`; isolating an address
/// drops all traffic to and from it.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<String, Weak<RaftNode>>>,
    isolated: RwLock<HashSet<String>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport for the node listening on `address`
    pub fn transport(self: &Arc<Self>, address: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            from: address.into(),
        }
    }

    pub async fn register(&self, address: impl Into<String>, node: &Arc<RaftNode>) {
        self.nodes
            .write()
            .await
            .insert(address.into(), Arc::downgrade(node));
    }

    pub async fn isolate(&self, address: &str) {
        tracing::info!(address, "Isolating node");
        self.isolated.write().await.insert(address.to_string());
    }

    pub async fn heal(&self, address: &str) {
        tracing::info!(address, "Reconnecting node");
        self.isolated.write().await.remove(address);
    }

    pub async fn heal_all(&self) {
        self.isolated.write().await.clear();
    }

    async fn deliver(&self, from: &str, to: &str, message: RaftMessage) -> Result<RaftMessage> {
        {
            let isolated = self.isolated.read().await;
            if isolated.contains(from) || isolated.contains(to) {
                return Err(RaftError::NetworkError(format!("{} unreachable from {}", to, from)));
            }
        }

        let node = self
            .nodes
            .read()
            .await
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| RaftError::NetworkError(format!("no node at {}", to)))?;

        let response = node.handle_message(message).await?;

        // The link may have been cut while the request was in flight
        let isolated = self.isolated.read().await;
        if isolated.contains(from) || isolated.contains(to) {
            return Err(RaftError::NetworkError(format!("{} unreachable from {}", from, to)));
        }
        Ok(response)
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    from: String,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, target: &Server, message: RaftMessage) -> Result<RaftMessage> {
        self.network.deliver(&self.from, &target.address(), message).await
    }
}
