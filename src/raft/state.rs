use super::types::{AppliedEntry, LogEntry, LogIndex, NodeId, Term};
use crate::storage::PersistentState;
use crate::util::errors::{RaftError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::time::Instant;

/// The three states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Follower state - receives updates from leader
    Follower,
    /// Candidate state - requesting votes for leadership
    Candidate,
    /// Leader state - manages log replication
    Leader,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Follower => write!(f, "Follower"),
            NodeState::Candidate => write!(f, "Candidate"),
            NodeState::Leader => write!(f, "Leader"),
        }
    }
}

/// Number of nodes needed for a strict majority of `cluster_size`
pub fn majority(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

/// Complete state of a Raft node.
///
/// Every field is read and written under the owning node's lock, see
/// [`crate::raft::node::RaftNode`]. Invariant after every transition:
/// `last_applied <= commit_index <= last_log_index()`.
#[derive(Debug, Clone)]
pub struct RaftState {
    // Persistent state on all servers
    /// Latest term server has seen (initialized to 0)
    pub current_term: Term,
    /// Candidate that received our vote in current term. `None` on a fresh
    /// node or after adopting a newer term; a candidate holds its own id.
    pub voted_for: Option<NodeId>,
    /// Log entries; index 1 is `log[0]`
    pub log: Vec<LogEntry>,

    // Volatile state on all servers
    /// Index of highest log entry known to be committed
    pub commit_index: LogIndex,
    /// Index of highest log entry applied to state machine
    pub last_applied: LogIndex,
    /// Current role of this node
    pub state: NodeState,
    /// ID of the current leader (if known)
    pub current_leader: Option<NodeId>,
    /// This node's ID
    pub node_id: NodeId,
    /// Last time a valid heartbeat arrived or a vote was granted
    pub last_heartbeat: Instant,

    // Volatile state on leaders (reinitialized after election)
    /// For each server, index of the next log entry to send to that server
    pub next_index: HashMap<NodeId, LogIndex>,
    /// For each server, index of highest log entry known to be replicated on server
    pub match_index: HashMap<NodeId, LogIndex>,

    // Election state for candidates
    /// Set of nodes that voted for this candidate in current election
    pub votes_received: HashSet<NodeId>,
}

impl RaftState {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            state: NodeState::Follower,
            current_leader: None,
            node_id,
            last_heartbeat: Instant::now(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: HashSet::new(),
        }
    }

    /// Rebuild a follower from previously persisted term, vote and log
    pub fn restore(
        node_id: NodeId,
        current_term: Term,
        voted_for: Option<NodeId>,
        log: Vec<LogEntry>,
    ) -> Self {
        Self {
            current_term,
            voted_for,
            log,
            ..Self::new(node_id)
        }
    }

    pub fn last_log_index(&self) -> LogIndex {
        self.log.len() as LogIndex
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// Entry at a 1-based index
    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize)
    }

    /// Term of the entry at `index`; index 0 is the empty prefix with term 0
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.entry(index).map(|e| e.term)
    }

    /// Entries from `start` (inclusive) to the end of the log
    pub fn entries_from(&self, start: LogIndex) -> Vec<LogEntry> {
        let start = start.max(1);
        if start > self.last_log_index() {
            return Vec::new();
        }
        self.log[(start - 1) as usize..].to_vec()
    }

    /// Append a command in the current term. Leader only.
    pub fn append(&mut self, data: Vec<u8>) -> Result<LogIndex> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader(self.current_leader));
        }
        self.log.push(LogEntry::new(self.current_term, data));
        Ok(self.last_log_index())
    }

    /// Drop the entry at `from_index` and everything after it.
    ///
    /// A leader never removes entries from its own log, and committed
    /// entries are never removed.
    pub fn truncate_from(&mut self, from_index: LogIndex) -> Result<()> {
        if self.is_leader() {
            return Err(RaftError::InvalidState(
                "leader cannot truncate its own log".to_string(),
            ));
        }
        if from_index <= self.commit_index {
            return Err(RaftError::LogInconsistency);
        }
        if from_index <= self.last_log_index() {
            self.log.truncate((from_index - 1) as usize);
            tracing::info!(
                "Node {} truncated log from index {}",
                self.node_id,
                from_index
            );
        }
        Ok(())
    }

    /// Transition to follower state. The vote is only cleared when the
    /// term actually advances, so a node never votes twice in one term.
    pub fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        if self.state != NodeState::Follower {
            tracing::info!(
                "Node {} transitioning to Follower (term: {})",
                self.node_id,
                self.current_term
            );
        }
        self.state = NodeState::Follower;
        self.current_leader = leader;
        self.next_index.clear();
        self.match_index.clear();
        self.votes_received.clear();
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self) {
        self.current_term += 1;
        self.state = NodeState::Candidate;
        self.voted_for = Some(self.node_id);
        self.current_leader = None;
        self.votes_received.clear();
        self.votes_received.insert(self.node_id);
        self.last_heartbeat = Instant::now();

        tracing::info!(
            "Node {} transitioning to Candidate (term: {})",
            self.node_id,
            self.current_term
        );
    }

    /// Transition to leader state
    pub fn become_leader(&mut self, peer_ids: &[NodeId]) {
        tracing::info!(
            "Node {} transitioning to Leader (term: {})",
            self.node_id,
            self.current_term
        );

        self.state = NodeState::Leader;
        self.current_leader = Some(self.node_id);

        // Reinitialize leader state
        self.next_index.clear();
        self.match_index.clear();

        let next = self.last_log_index() + 1;
        for &peer_id in peer_ids {
            if peer_id != self.node_id {
                self.next_index.insert(peer_id, next);
                self.match_index.insert(peer_id, 0);
            }
        }

        self.votes_received.clear();
    }

    /// Add a vote for this node
    pub fn add_vote(&mut self, from: NodeId) {
        self.votes_received.insert(from);
    }

    /// Check if we have received votes from a majority
    pub fn has_majority(&self, cluster_size: usize) -> bool {
        self.votes_received.len() >= majority(cluster_size)
    }

    /// Adopt a higher term and fall back to follower. Returns whether the
    /// term changed.
    pub fn update_term(&mut self, term: Term) -> bool {
        if term > self.current_term {
            tracing::info!(
                "Node {} updating term from {} to {}",
                self.node_id,
                self.current_term,
                term
            );
            self.become_follower(term, None);
            true
        } else {
            false
        }
    }

    /// Candidate's log is at least as up-to-date as ours: compare last
    /// terms first, then lengths.
    pub fn is_log_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let our_last_term = self.last_log_term();
        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= self.last_log_index())
    }

    pub fn reset_election_timer(&mut self) {
        self.last_heartbeat = Instant::now();
    }

    /// Move every committed but unapplied entry out for application and
    /// advance `last_applied` past them.
    pub fn take_unapplied(&mut self) -> Vec<AppliedEntry> {
        let mut applied = Vec::new();
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            match self.entry(index) {
                Some(entry) => applied.push(AppliedEntry {
                    index,
                    entry: entry.clone(),
                }),
                None => break,
            }
            self.last_applied = index;
        }
        applied
    }

    pub fn indices_consistent(&self) -> bool {
        self.last_applied <= self.commit_index && self.commit_index <= self.last_log_index()
    }

    /// Check if we're the leader
    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    /// Check if we're a candidate
    pub fn is_candidate(&self) -> bool {
        self.state == NodeState::Candidate
    }

    /// Check if we're a follower
    pub fn is_follower(&self) -> bool {
        self.state == NodeState::Follower
    }

    /// The term/vote pair that must be durable before this node answers
    pub fn hard_state(&self) -> PersistentState {
        PersistentState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            node_id: self.node_id,
            state: self.state,
            current_term: self.current_term,
            voted_for: self.voted_for,
            current_leader: self.current_leader,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        }
    }
}

/// Read-only view of a node's state, exchanged with peers for monitoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub node_id: NodeId,
    pub state: NodeState,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub current_leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_log(terms: &[Term]) -> RaftState {
        let log = terms.iter().map(|&t| LogEntry::new(t, vec![])).collect();
        RaftState::restore(1, terms.last().copied().unwrap_or(0), None, log)
    }

    #[test]
    fn test_majority() {
        assert_eq!(majority(1), 1);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(4), 3);
        assert_eq!(majority(5), 3);
    }

    #[test]
    fn test_candidate_votes_for_itself() {
        let mut state = RaftState::new(1);
        state.become_candidate();

        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for, Some(1));
        assert!(state.votes_received.contains(&1));
        assert!(!state.has_majority(3));

        state.add_vote(2);
        assert!(state.has_majority(3));
    }

    #[test]
    fn test_same_term_follower_keeps_vote() {
        let mut state = RaftState::new(1);
        state.become_candidate();
        state.become_follower(1, Some(2));

        assert_eq!(state.voted_for, Some(1));
        assert_eq!(state.current_leader, Some(2));

        state.become_follower(2, None);
        assert_eq!(state.voted_for, None);
        assert_eq!(state.current_term, 2);
    }

    #[test]
    fn test_become_leader_resets_progress() {
        let mut state = with_log(&[1, 1]);
        state.state = NodeState::Candidate;
        state.become_leader(&[1, 2, 3]);

        assert_eq!(state.next_index.get(&2), Some(&3));
        assert_eq!(state.match_index.get(&3), Some(&0));
        assert!(!state.next_index.contains_key(&1));
    }

    #[test]
    fn test_up_to_date_compares_term_then_length() {
        let state = with_log(&[1, 2, 2]);

        assert!(state.is_log_up_to_date(1, 3));
        assert!(state.is_log_up_to_date(3, 2));
        assert!(state.is_log_up_to_date(4, 2));
        assert!(!state.is_log_up_to_date(2, 2));
        assert!(!state.is_log_up_to_date(10, 1));
    }

    #[test]
    fn test_leader_cannot_truncate() {
        let mut state = with_log(&[1, 1]);
        state.state = NodeState::Leader;
        assert!(state.truncate_from(1).is_err());
        assert_eq!(state.last_log_index(), 2);
    }

    #[test]
    fn test_committed_prefix_is_never_truncated() {
        let mut state = with_log(&[1, 1, 1]);
        state.commit_index = 2;
        assert!(state.truncate_from(2).is_err());
        state.truncate_from(3).unwrap();
        assert_eq!(state.last_log_index(), 2);
    }

    #[test]
    fn test_take_unapplied_in_order() {
        let mut state = with_log(&[1, 1, 2]);
        state.commit_index = 2;

        let applied = state.take_unapplied();
        assert_eq!(applied.iter().map(|a| a.index).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(state.last_applied, 2);
        assert!(state.take_unapplied().is_empty());
        assert!(state.indices_consistent());
    }

    #[test]
    fn test_append_requires_leadership() {
        let mut state = RaftState::new(1);
        assert!(matches!(state.append(vec![1]), Err(RaftError::NotLeader(None))));

        state.become_candidate();
        state.become_leader(&[2]);
        assert_eq!(state.append(vec![1]).unwrap(), 1);
        assert_eq!(state.entry(1).unwrap().term, 1);
    }
}
