//! Shared harness: whole clusters running inside one runtime over the
//! in-memory network, with in-memory storage.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use raftnode::cluster::ClusterDirectory;
use raftnode::config::{RaftConfig, Server};
use raftnode::network::MemoryNetwork;
use raftnode::raft::{AppliedEntry, NodeId, NodeState, RaftNode, StateSnapshot};
use raftnode::storage::{MemLogStorage, MemStateStorage};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub fn server(id: NodeId) -> Server {
    Server::new(format!("10.0.0.{}", id), "7000")
}

pub fn address(id: NodeId) -> String {
    server(id).address()
}

pub struct TestCluster {
    pub network: Arc<MemoryNetwork>,
    pub nodes: BTreeMap<NodeId, Arc<RaftNode>>,
    pub applied: BTreeMap<NodeId, UnboundedReceiver<AppliedEntry>>,
    drivers: Vec<JoinHandle<()>>,
}

impl TestCluster {
    /// Nodes 1..=n, all followers in term 0
    pub async fn new(n: u64) -> Self {
        Self::with_config(n, |_| {}).await
    }

    /// Like [`TestCluster::new`], with `tweak` applied to every node's config
    pub async fn with_config(n: u64, tweak: impl Fn(&mut RaftConfig)) -> Self {
        let network = MemoryNetwork::new();
        let mut nodes = BTreeMap::new();
        let mut applied = BTreeMap::new();

        for id in 1..=n {
            let mut config = RaftConfig {
                node_id: id,
                ..RaftConfig::default()
            };
            tweak(&mut config);
            let cluster = ClusterDirectory::from_peers(
                (1..=n).filter(|peer| *peer != id).map(|peer| (peer, server(peer))),
            );

            let (node, applied_rx) = RaftNode::new(
                config,
                Arc::new(cluster),
                Arc::new(network.transport(address(id))),
                Box::new(MemLogStorage::new()),
                Box::new(MemStateStorage::new()),
            )
            .expect("node should start");

            let node = Arc::new(node);
            network.register(address(id), &node).await;
            nodes.insert(id, node);
            applied.insert(id, applied_rx);
        }

        Self {
            network,
            nodes,
            applied,
            drivers: Vec::new(),
        }
    }

    pub fn node(&self, id: NodeId) -> &Arc<RaftNode> {
        &self.nodes[&id]
    }

    pub async fn isolate(&self, id: NodeId) {
        self.network.isolate(&address(id)).await;
    }

    pub async fn heal(&self, id: NodeId) {
        self.network.heal(&address(id)).await;
    }

    /// Spawn every node's timer loop
    pub fn start(&mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            self.start_node(id);
        }
    }

    /// Spawn one node's timer loop
    pub fn start_node(&mut self, id: NodeId) {
        let node = self.nodes[&id].clone();
        self.drivers.push(tokio::spawn(async move { node.run().await }));
    }

    pub async fn stop(&mut self) {
        for node in self.nodes.values() {
            node.shutdown();
        }
        for driver in self.drivers.drain(..) {
            let _ = driver.await;
        }
    }

    pub async fn statuses(&self) -> BTreeMap<NodeId, StateSnapshot> {
        let mut statuses = BTreeMap::new();
        for (id, node) in &self.nodes {
            statuses.insert(*id, node.status().await);
        }
        statuses
    }

    pub async fn leaders(&self) -> Vec<NodeId> {
        self.statuses()
            .await
            .into_iter()
            .filter(|(_, status)| status.state == NodeState::Leader)
            .map(|(id, _)| id)
            .collect()
    }

    /// Poll until some node is leader
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<NodeId> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(leader) = self.leaders().await.first() {
                return Some(*leader);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }

    /// Everything applied on `id` since the last drain
    pub fn drain_applied(&mut self, id: NodeId) -> Vec<AppliedEntry> {
        let rx = self.applied.get_mut(&id).expect("unknown node");
        let mut entries = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            entries.push(entry);
        }
        entries
    }

    /// LastApplied <= CommitIndex <= log length on every node, and no two
    /// leaders share a term
    pub async fn assert_invariants(&self) {
        let statuses = self.statuses().await;
        for (id, status) in &statuses {
            assert!(
                status.last_applied <= status.commit_index,
                "node {} applied past commit: {:?}",
                id,
                status
            );
            assert!(
                status.commit_index <= status.last_log_index,
                "node {} committed past its log: {:?}",
                id,
                status
            );
        }

        let mut leader_terms = Vec::new();
        for status in statuses.values() {
            if status.state == NodeState::Leader {
                assert!(
                    !leader_terms.contains(&status.current_term),
                    "two leaders in term {}",
                    status.current_term
                );
                leader_terms.push(status.current_term);
            }
        }
    }
}

pub fn data(entries: &[AppliedEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|applied| String::from_utf8_lossy(&applied.entry.data).into_owned())
        .collect()
}
