use crate::config::Server;
use crate::raft::state::{majority, StateSnapshot};
use crate::raft::types::{NodeId, Term};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Target of an outbound RPC
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Peer {
    pub id: NodeId,
    pub server: Server,
}

impl Peer {
    pub fn new(id: NodeId, server: Server) -> Self {
        Self { id, server }
    }

    pub fn address(&self) -> String {
        self.server.address()
    }
}

/// Last-known information about one peer. Best effort only, never used
/// to decide safety.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: NodeId,
    pub server: Server,
    /// Highest term seen in any response from this peer
    pub term: Term,
    pub reachable: bool,
    pub last_contact: Option<Instant>,
    pub consecutive_failures: u32,
    /// Latest full state reported by the peer
    pub snapshot: Option<StateSnapshot>,
}

impl PeerRecord {
    fn new(id: NodeId, server: Server) -> Self {
        Self {
            id,
            server,
            term: 0,
            reachable: false,
            last_contact: None,
            consecutive_failures: 0,
            snapshot: None,
        }
    }
}

/// Maps peer address to that peer's last-known state.
///
/// Shared by the node's election and replication rounds and by the RPC
/// layer. Updates are last-write-wins per entry.
#[derive(Debug, Default)]
pub struct ClusterDirectory {
    peers: RwLock<HashMap<String, PeerRecord>>,
}

impl ClusterDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a directory from the configured peers (this node excluded)
    pub fn from_peers<I>(peers: I) -> Self
    where
        I: IntoIterator<Item = (NodeId, Server)>,
    {
        let peers = peers
            .into_iter()
            .map(|(id, server)| (server.address(), PeerRecord::new(id, server)))
            .collect();

        Self {
            peers: RwLock::new(peers),
        }
    }

    /// Register a new peer, keeping what is already known about it
    pub async fn register(&self, id: NodeId, server: Server) {
        let mut peers = self.peers.write().await;
        peers
            .entry(server.address())
            .or_insert_with(|| PeerRecord::new(id, server));
    }

    /// Remove a peer from the directory
    pub async fn remove(&self, address: &str) -> Option<PeerRecord> {
        self.peers.write().await.remove(address)
    }

    /// Current peer set, ordered by id
    pub async fn peers(&self) -> Vec<Peer> {
        let peers = self.peers.read().await;
        let mut targets: Vec<Peer> = peers
            .values()
            .map(|record| Peer::new(record.id, record.server.clone()))
            .collect();
        targets.sort_by_key(|peer| peer.id);
        targets
    }

    /// Number of voting members, this node included
    pub async fn cluster_size(&self) -> usize {
        self.peers.read().await.len() + 1
    }

    /// Votes or acknowledgements needed for a quorum, this node included
    pub async fn majority(&self) -> usize {
        majority(self.cluster_size().await)
    }

    pub async fn get(&self, address: &str) -> Option<PeerRecord> {
        self.peers.read().await.get(address).cloned()
    }

    /// Note a response carrying `term` from the peer at `address`
    pub async fn record_response(&self, address: &str, term: Term) {
        let mut peers = self.peers.write().await;
        if let Some(record) = peers.get_mut(address) {
            record.term = record.term.max(term);
            record.reachable = true;
            record.last_contact = Some(Instant::now());
            record.consecutive_failures = 0;
        }
    }

    pub async fn record_snapshot(&self, address: &str, snapshot: StateSnapshot) {
        let mut peers = self.peers.write().await;
        if let Some(record) = peers.get_mut(address) {
            record.term = record.term.max(snapshot.current_term);
            record.reachable = true;
            record.last_contact = Some(Instant::now());
            record.consecutive_failures = 0;
            record.snapshot = Some(snapshot);
        }
    }

    /// Note a failed or timed-out call to the peer at `address`
    pub async fn record_failure(&self, address: &str) {
        let mut peers = self.peers.write().await;
        if let Some(record) = peers.get_mut(address) {
            record.reachable = false;
            record.consecutive_failures += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory(n: u64) -> ClusterDirectory {
        ClusterDirectory::from_peers(
            (2..=n).map(|id| (id, Server::new("127.0.0.1", format!("{}", 7000 + id)))),
        )
    }

    #[tokio::test]
    async fn test_quorum_sizing() {
        assert_eq!(directory(1).cluster_size().await, 1);
        assert_eq!(directory(1).majority().await, 1);
        assert_eq!(directory(3).majority().await, 2);
        assert_eq!(directory(4).majority().await, 3);
        assert_eq!(directory(5).majority().await, 3);
    }

    #[tokio::test]
    async fn test_peers_sorted_by_id() {
        let ids: Vec<NodeId> = directory(5).peers().await.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_records_track_contact() {
        let directory = directory(3);

        directory.record_failure("127.0.0.1:7002").await;
        directory.record_failure("127.0.0.1:7002").await;
        let record = directory.get("127.0.0.1:7002").await.unwrap();
        assert!(!record.reachable);
        assert_eq!(record.consecutive_failures, 2);

        directory.record_response("127.0.0.1:7002", 4).await;
        directory.record_response("127.0.0.1:7002", 3).await;
        let record = directory.get("127.0.0.1:7002").await.unwrap();
        assert!(record.reachable);
        assert_eq!(record.term, 4);
        assert_eq!(record.consecutive_failures, 0);

        // Unknown peers are not added implicitly
        directory.record_response("10.0.0.1:1", 1).await;
        assert_eq!(directory.cluster_size().await, 3);
    }

    #[tokio::test]
    async fn test_register_and_remove() {
        let directory = ClusterDirectory::new();
        directory.register(2, Server::new("a", "1")).await;
        directory.register(2, Server::new("a", "1")).await;
        assert_eq!(directory.cluster_size().await, 2);

        assert!(directory.remove("a:1").await.is_some());
        assert_eq!(directory.cluster_size().await, 1);
    }
}
