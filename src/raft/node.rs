use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use super::election::{create_request_vote, handle_request_vote, handle_request_vote_response};
use super::log::{
    advance_commit_index, create_append_entries, handle_append_entries,
    handle_append_entries_response,
};
use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, RaftMessage, RequestVoteRequest,
    RequestVoteResponse,
};
use super::state::{RaftState, StateSnapshot};
use super::timer::random_election_timeout;
use super::types::{AppliedEntry, LogEntry, LogIndex, NodeId, Term};
use crate::cluster::{collect, fan_out, ClusterDirectory, Peer, PeerReply};
use crate::config::RaftConfig;
use crate::network::Transport;
use crate::storage::{LogStorage, StateStorage};
use crate::util::errors::{RaftError, Result};

/// Everything guarded by the node lock
struct NodeCore {
    state: RaftState,
    log_storage: Box<dyn LogStorage>,
    state_storage: Box<dyn StateStorage>,
}

impl NodeCore {
    fn persist_hard_state(&mut self) -> Result<()> {
        self.state_storage.save_state(&self.state.hard_state())
    }
}

/// One node's participation in the cluster.
///
/// All reads and writes of the Raft state happen under a single lock.
/// Outbound RPCs are issued with the lock released and their results are
/// merged back in one short critical section per response.
pub struct RaftNode {
    id: NodeId,
    config: RaftConfig,
    core: Mutex<NodeCore>,
    cluster: Arc<ClusterDirectory>,
    transport: Arc<dyn Transport>,
    applied_tx: mpsc::UnboundedSender<AppliedEntry>,
    replicate_now: Notify,
    shutdown: CancellationToken,
}

impl RaftNode {
    /// Create a node from its persisted term, vote and log. The returned
    /// receiver yields every committed entry exactly once, in log order.
    pub fn new(
        config: RaftConfig,
        cluster: Arc<ClusterDirectory>,
        transport: Arc<dyn Transport>,
        log_storage: Box<dyn LogStorage>,
        state_storage: Box<dyn StateStorage>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<AppliedEntry>)> {
        config.validate().map_err(RaftError::InvalidConfig)?;

        let persisted = state_storage.load_state()?;
        let log = log_storage.entries()?;

        tracing::info!(
            node_id = config.node_id,
            term = persisted.current_term,
            voted_for = ?persisted.voted_for,
            log_len = log.len(),
            "Restored raft state"
        );

        let state = RaftState::restore(
            config.node_id,
            persisted.current_term,
            persisted.voted_for,
            log,
        );
        let (applied_tx, applied_rx) = mpsc::unbounded_channel();

        let node = Self {
            id: config.node_id,
            config,
            core: Mutex::new(NodeCore {
                state,
                log_storage,
                state_storage,
            }),
            cluster,
            transport,
            applied_tx,
            replicate_now: Notify::new(),
            shutdown: CancellationToken::new(),
        };

        Ok((node, applied_rx))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn cluster(&self) -> &Arc<ClusterDirectory> {
        &self.cluster
    }

    /// Token that stops [`RaftNode::run`] and the RPC server when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Drive election timeouts and heartbeats until shutdown
    pub async fn run(&self) {
        tracing::info!(node_id = self.id, "Raft node started");

        loop {
            let is_leader = self.core.lock().await.state.is_leader();

            if is_leader {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.heartbeat_interval()) => {}
                    _ = self.replicate_now.notified() => {}
                }

                if let Err(e) = self.replicate().await {
                    tracing::error!(node_id = self.id, error = %e, "Replication round failed");
                }
            } else {
                let election_timeout = random_election_timeout(
                    self.config.election_timeout_min_ms,
                    self.config.election_timeout_max_ms,
                );

                // Measured from the last heartbeat, not from when we went to sleep
                let deadline = self.core.lock().await.state.last_heartbeat + election_timeout;

                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline) => {}
                }

                let elapsed = self.core.lock().await.state.last_heartbeat.elapsed();
                if elapsed >= election_timeout {
                    tracing::info!(
                        node_id = self.id,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Election timeout, starting election"
                    );
                    if let Err(e) = self.start_election().await {
                        tracing::error!(node_id = self.id, error = %e, "Election failed");
                    }
                }
            }
        }

        tracing::info!(node_id = self.id, "Raft node stopped");
    }

    /// Become a candidate for the next term and ask every peer for its vote.
    ///
    /// Returns true if this node won. Votes are counted as they arrive; the
    /// round is abandoned as soon as the node wins, steps down, or moves to
    /// another term.
    pub async fn start_election(&self) -> Result<bool> {
        let peers = self.cluster.peers().await;
        let cluster_size = self.cluster.cluster_size().await;
        let peer_ids: Vec<NodeId> = peers.iter().map(|p| p.id).collect();

        let request = {
            let mut core = self.core.lock().await;
            if core.state.is_leader() {
                return Ok(true);
            }

            core.state.become_candidate();
            core.persist_hard_state()?;

            if core.state.has_majority(cluster_size) {
                core.state.become_leader(&peer_ids);
                drop(core);
                self.replicate().await?;
                return Ok(true);
            }

            create_request_vote(&core.state)
        };
        let election_term = request.term;

        let quorum = self.cluster.majority().await;
        tracing::info!(
            node_id = self.id,
            term = election_term,
            peers = peers.len(),
            quorum,
            "Starting election"
        );

        let transport = self.transport.clone();
        let mut replies = fan_out(peers, self.config.rpc_timeout(), |peer| {
            let transport = transport.clone();
            let server = peer.server.clone();
            let message = RaftMessage::RequestVote(request.clone());
            async move { transport.send(&server, message).await }
        });

        while let Some(reply) = replies.next().await {
            let response = match self.expect_vote_response(&reply.peer, reply.result).await {
                Some(response) => response,
                None => continue,
            };

            let mut core = self.core.lock().await;
            let term_before = core.state.current_term;
            let won = handle_request_vote_response(
                &mut core.state,
                reply.peer.id,
                election_term,
                response,
                cluster_size,
            );

            if core.state.current_term > term_before {
                core.persist_hard_state()?;
            }

            if won {
                core.state.become_leader(&peer_ids);
                drop(core);
                // Assert leadership right away; peers not yet asked still
                // get their vote request
                let (replicated, ()) = tokio::join!(
                    self.replicate(),
                    self.finish_vote_round(replies, election_term)
                );
                replicated?;
                return Ok(true);
            }

            if !core.state.is_candidate() || core.state.current_term != election_term {
                tracing::debug!(
                    node_id = self.id,
                    term = election_term,
                    "Abandoning election"
                );
                return Ok(false);
            }
        }

        tracing::debug!(
            node_id = self.id,
            term = election_term,
            "Election ended without a majority"
        );
        Ok(false)
    }

    /// Deliver the outstanding vote requests of a won election. Late replies
    /// only matter when they carry a higher term.
    async fn finish_vote_round(
        &self,
        mut replies: FuturesUnordered<BoxFuture<'static, PeerReply<RaftMessage>>>,
        election_term: Term,
    ) {
        while let Some(reply) = replies.next().await {
            let Some(response) = self.expect_vote_response(&reply.peer, reply.result).await else {
                continue;
            };
            if response.term <= election_term {
                continue;
            }

            let mut core = self.core.lock().await;
            if core.state.update_term(response.term) {
                if let Err(e) = core.persist_hard_state() {
                    tracing::error!(node_id = self.id, error = %e, "Failed to persist term");
                }
            }
        }
    }

    /// Send one round of AppendEntries to every peer (heartbeat when a peer
    /// is up to date). No-op unless this node is leader.
    pub async fn replicate(&self) -> Result<()> {
        let peers = self.cluster.peers().await;

        let requests: HashMap<NodeId, AppendEntriesRequest> = {
            let mut core = self.core.lock().await;
            if !core.state.is_leader() {
                return Ok(());
            }

            // A leader without peers commits on its own
            if advance_commit_index(&mut core.state) {
                self.apply_committed(&mut core);
            }

            peers
                .iter()
                .map(|peer| (peer.id, create_append_entries(&core.state, peer.id)))
                .collect()
        };

        let transport = self.transport.clone();
        let mut replies = fan_out(peers, self.config.rpc_timeout(), |peer| {
            let transport = transport.clone();
            let server = peer.server.clone();
            let message = requests
                .get(&peer.id)
                .cloned()
                .map(RaftMessage::AppendEntries);
            async move {
                match message {
                    Some(message) => transport.send(&server, message).await,
                    None => Err(RaftError::InvalidState("no request for peer".to_string())),
                }
            }
        });

        while let Some(reply) = replies.next().await {
            let response = match self.expect_append_response(&reply.peer, reply.result).await {
                Some(response) => response,
                None => continue,
            };
            let Some(request) = requests.get(&reply.peer.id) else {
                continue;
            };

            let mut core = self.core.lock().await;
            let term_before = core.state.current_term;
            let advanced = handle_append_entries_response(
                &mut core.state,
                reply.peer.id,
                request.term,
                request.prev_log_index,
                request.entries.len(),
                response,
            );

            if core.state.current_term > term_before {
                core.persist_hard_state()?;
                tracing::info!(
                    node_id = self.id,
                    term = core.state.current_term,
                    "Stepped down after seeing a higher term"
                );
                return Ok(());
            }

            if !core.state.is_leader() {
                return Ok(());
            }

            if advanced {
                self.apply_committed(&mut core);
            }
        }

        Ok(())
    }

    /// Append a command to the leader's log and trigger replication.
    /// Returns the index the command will occupy once committed.
    pub async fn submit(&self, data: Vec<u8>) -> Result<LogIndex> {
        let index = {
            let mut core = self.core.lock().await;
            let index = core.state.append(data)?;

            let NodeCore {
                state, log_storage, ..
            } = &mut *core;
            if let Err(e) = log_storage.append(&state.log[(index - 1) as usize..]) {
                // Never persisted and never sent, so nobody can have seen it
                state.log.pop();
                return Err(e);
            }

            tracing::info!(node_id = self.id, index, "Leader appended entry");
            index
        };

        self.replicate_now.notify_one();
        Ok(index)
    }

    /// Handle incoming RequestVote RPC
    pub async fn handle_request_vote(
        &self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse> {
        let mut core = self.core.lock().await;
        let NodeCore {
            state,
            state_storage,
            ..
        } = &mut *core;
        handle_request_vote(state, state_storage.as_mut(), request)
    }

    /// Handle incoming AppendEntries RPC
    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let mut core = self.core.lock().await;
        let response = {
            let NodeCore {
                state,
                log_storage,
                state_storage,
            } = &mut *core;
            handle_append_entries(state, state_storage.as_mut(), log_storage.as_mut(), request)?
        };

        self.apply_committed(&mut core);
        Ok(response)
    }

    /// Dispatch an inbound request from the RPC server
    pub async fn handle_message(&self, message: RaftMessage) -> Result<RaftMessage> {
        match message {
            RaftMessage::RequestVote(request) => self
                .handle_request_vote(request)
                .await
                .map(RaftMessage::RequestVoteResponse),
            RaftMessage::AppendEntries(request) => self
                .handle_append_entries(request)
                .await
                .map(RaftMessage::AppendEntriesResponse),
            RaftMessage::Status => Ok(RaftMessage::StatusResponse(self.status().await)),
            other => Err(RaftError::InvalidState(format!(
                "{} is not a request",
                other.kind()
            ))),
        }
    }

    /// Ask every peer for its state and store the answers in the cluster
    /// directory
    pub async fn refresh_directory(&self) -> HashMap<NodeId, Result<StateSnapshot>> {
        let peers = self.cluster.peers().await;
        let addresses: HashMap<NodeId, String> =
            peers.iter().map(|peer| (peer.id, peer.address())).collect();

        let transport = self.transport.clone();
        let replies = fan_out(peers, self.config.rpc_timeout(), |peer| {
            let transport = transport.clone();
            let server = peer.server.clone();
            async move {
                match transport.send(&server, RaftMessage::Status).await? {
                    RaftMessage::StatusResponse(snapshot) => Ok(snapshot),
                    other => Err(RaftError::NetworkError(format!(
                        "unexpected {} to Status",
                        other.kind()
                    ))),
                }
            }
        });

        let results = collect(replies).await;
        for (id, result) in &results {
            let Some(address) = addresses.get(id) else {
                continue;
            };
            match result {
                Ok(snapshot) => self.cluster.record_snapshot(address, snapshot.clone()).await,
                Err(_) => self.cluster.record_failure(address).await,
            }
        }
        results
    }

    pub async fn status(&self) -> StateSnapshot {
        self.core.lock().await.state.snapshot()
    }

    pub async fn is_leader(&self) -> bool {
        self.core.lock().await.state.is_leader()
    }

    pub async fn current_term(&self) -> Term {
        self.core.lock().await.state.current_term
    }

    pub async fn leader_id(&self) -> Option<NodeId> {
        self.core.lock().await.state.current_leader
    }

    /// Copy of the whole log
    pub async fn log_entries(&self) -> Vec<LogEntry> {
        self.core.lock().await.state.log.clone()
    }

    /// Hand newly committed entries to the application. Runs under the node
    /// lock so entries leave in log order.
    fn apply_committed(&self, core: &mut NodeCore) {
        for applied in core.state.take_unapplied() {
            tracing::debug!(node_id = self.id, index = applied.index, "Applying entry");
            if self.applied_tx.send(applied).is_err() {
                tracing::trace!(node_id = self.id, "Applied-entry receiver dropped");
            }
        }
    }

    async fn expect_vote_response(
        &self,
        peer: &Peer,
        result: Result<RaftMessage>,
    ) -> Option<RequestVoteResponse> {
        match result {
            Ok(RaftMessage::RequestVoteResponse(response)) => {
                self.cluster.record_response(&peer.address(), response.term).await;
                Some(response)
            }
            other => {
                self.note_bad_reply(peer, "RequestVote", other).await;
                None
            }
        }
    }

    async fn expect_append_response(
        &self,
        peer: &Peer,
        result: Result<RaftMessage>,
    ) -> Option<AppendEntriesResponse> {
        match result {
            Ok(RaftMessage::AppendEntriesResponse(response)) => {
                self.cluster.record_response(&peer.address(), response.term).await;
                Some(response)
            }
            other => {
                self.note_bad_reply(peer, "AppendEntries", other).await;
                None
            }
        }
    }

    async fn note_bad_reply(&self, peer: &Peer, rpc: &str, result: Result<RaftMessage>) {
        match result {
            Ok(message) => tracing::warn!(
                node_id = self.id,
                peer = peer.id,
                "Unexpected {} in reply to {}",
                message.kind(),
                rpc
            ),
            Err(RaftError::Timeout(_)) => {
                tracing::warn!(node_id = self.id, peer = peer.id, "{} timed out", rpc)
            }
            Err(e) => {
                tracing::warn!(node_id = self.id, peer = peer.id, error = %e, "{} failed", rpc)
            }
        }
        self.cluster.record_failure(&peer.address()).await;
    }
}
