use super::rpc::{AppendEntriesRequest, AppendEntriesResponse};
use super::state::{majority, RaftState};
use super::types::{LogIndex, NodeId, Term};
use crate::storage::{LogStorage, StateStorage};
use crate::util::errors::{RaftError, Result};

/// Handle incoming AppendEntries RPC.
///
/// Log changes and term changes reach storage before the response is
/// returned.
pub fn handle_append_entries<L: LogStorage + ?Sized, S: StateStorage + ?Sized>(
    raft_state: &mut RaftState,
    state_storage: &mut S,
    log_storage: &mut L,
    request: AppendEntriesRequest,
) -> Result<AppendEntriesResponse> {
    // If request term is greater, update our term and become follower
    if raft_state.update_term(request.term) {
        state_storage.save_state(&raft_state.hard_state())?;
    }

    // Reply false if term < currentTerm
    if request.term < raft_state.current_term {
        tracing::debug!(
            "Node {} rejected AppendEntries from {} - stale term ({} < {})",
            raft_state.node_id,
            request.leader_id,
            request.term,
            raft_state.current_term
        );

        return Ok(AppendEntriesResponse::reject(raft_state.current_term, None, None));
    }

    if raft_state.is_leader() {
        tracing::error!(
            "Node {} is leader of term {} but got AppendEntries from {}",
            raft_state.node_id,
            raft_state.current_term,
            request.leader_id
        );
        return Err(RaftError::InvalidState(format!(
            "two leaders in term {}",
            raft_state.current_term
        )));
    }

    // Valid leader for this term; a candidate gives up its election
    raft_state.become_follower(request.term, Some(request.leader_id));
    raft_state.reset_election_timer();

    // Check log consistency
    match raft_state.term_at(request.prev_log_index) {
        None => {
            tracing::debug!(
                "Node {} rejected AppendEntries - missing entry at index {}",
                raft_state.node_id,
                request.prev_log_index
            );

            return Ok(AppendEntriesResponse::reject(
                raft_state.current_term,
                Some(raft_state.last_log_index() + 1),
                None,
            ));
        }
        Some(term) if term != request.prev_log_term => {
            tracing::debug!(
                "Node {} rejected AppendEntries - term mismatch at index {} ({} != {})",
                raft_state.node_id,
                request.prev_log_index,
                term,
                request.prev_log_term
            );

            // Find the first index with the conflicting term
            let mut conflict_index = request.prev_log_index;
            while conflict_index > 1 && raft_state.term_at(conflict_index - 1) == Some(term) {
                conflict_index -= 1;
            }

            return Ok(AppendEntriesResponse::reject(
                raft_state.current_term,
                Some(conflict_index),
                Some(term),
            ));
        }
        Some(_) => {}
    }

    // Skip entries we already hold, cut the log at the first conflict and
    // append the rest
    for (offset, new_entry) in request.entries.iter().enumerate() {
        let index = request.prev_log_index + 1 + offset as LogIndex;

        match raft_state.term_at(index) {
            Some(term) if term == new_entry.term => continue,
            Some(_) => {
                tracing::info!(
                    "Node {} found log conflict at index {}, truncating",
                    raft_state.node_id,
                    index
                );
                log_storage.truncate(index)?;
                raft_state.truncate_from(index)?;
            }
            None => {}
        }

        let remaining = &request.entries[offset..];
        log_storage.append(remaining)?;
        raft_state.log.extend_from_slice(remaining);

        tracing::debug!(
            "Node {} appended {} entries from leader {}",
            raft_state.node_id,
            remaining.len(),
            request.leader_id
        );
        break;
    }

    // Update commit index
    let last_new_entry_index = request.prev_log_index + request.entries.len() as LogIndex;
    let new_commit = std::cmp::min(request.leader_commit, last_new_entry_index);
    if new_commit > raft_state.commit_index {
        raft_state.commit_index = new_commit;

        tracing::debug!(
            "Node {} updated commit_index to {}",
            raft_state.node_id,
            raft_state.commit_index
        );
    }

    Ok(AppendEntriesResponse {
        term: raft_state.current_term,
        success: true,
        conflict_index: None,
        conflict_term: None,
    })
}

/// Handle AppendEntries response (for leaders).
///
/// `request_term`, `prev_log_index` and `sent_entries` describe the request
/// this response answers. Returns true when the commit index advanced.
pub fn handle_append_entries_response(
    raft_state: &mut RaftState,
    from: NodeId,
    request_term: Term,
    prev_log_index: LogIndex,
    sent_entries: usize,
    response: AppendEntriesResponse,
) -> bool {
    // If response term is greater, update our term and step down
    if raft_state.update_term(response.term) {
        return false;
    }

    // Ignore if we're not leader anymore, or the response belongs to an
    // earlier leadership
    if !raft_state.is_leader() || raft_state.current_term != request_term {
        return false;
    }

    if response.success {
        let new_match_index = prev_log_index + sent_entries as LogIndex;

        let match_idx = raft_state.match_index.entry(from).or_insert(0);
        *match_idx = std::cmp::max(*match_idx, new_match_index);
        let match_idx = *match_idx;
        raft_state.next_index.insert(from, match_idx + 1);

        tracing::debug!(
            "Node {} updated match_index for {} to {}",
            raft_state.node_id,
            from,
            match_idx
        );

        return advance_commit_index(raft_state);
    }

    let current = raft_state
        .next_index
        .get(&from)
        .copied()
        .unwrap_or(raft_state.last_log_index() + 1);

    let mut next = match (response.conflict_term, response.conflict_index) {
        (Some(conflict_term), conflict_index) => {
            // Resume right after our last entry of the conflicting term, or
            // at the start of the follower's run of that term
            match last_index_of_term(raft_state, conflict_term) {
                Some(index) => index + 1,
                None => conflict_index.unwrap_or(current.saturating_sub(1)),
            }
        }
        (None, Some(conflict_index)) => conflict_index,
        (None, None) => current.saturating_sub(1),
    };

    let floor = raft_state.match_index.get(&from).copied().unwrap_or(0) + 1;
    next = next.clamp(floor, raft_state.last_log_index() + 1);
    raft_state.next_index.insert(from, next);

    tracing::debug!(
        "Node {} decremented next_index for {} to {}",
        raft_state.node_id,
        from,
        next
    );

    false
}

fn last_index_of_term(raft_state: &RaftState, term: Term) -> Option<LogIndex> {
    raft_state
        .log
        .iter()
        .rposition(|e| e.term == term)
        .map(|pos| pos as LogIndex + 1)
}

/// Advance the leader's commit index to the highest N replicated on a
/// majority whose entry was created in the current term. Entries of earlier
/// terms only commit underneath such an N. Returns true if it moved.
pub fn advance_commit_index(raft_state: &mut RaftState) -> bool {
    if !raft_state.is_leader() {
        return false;
    }

    let cluster_size = raft_state.match_index.len() + 1; // +1 for ourselves
    let needed = majority(cluster_size);

    let mut n = raft_state.last_log_index();
    while n > raft_state.commit_index {
        if raft_state.term_at(n) != Some(raft_state.current_term) {
            // Older terms are never counted directly, and terms only
            // decrease walking backwards
            break;
        }

        // Count ourselves
        let count = 1 + raft_state.match_index.values().filter(|&&m| m >= n).count();

        if count >= needed {
            raft_state.commit_index = n;
            tracing::info!(
                "Leader {} advanced commit_index to {}",
                raft_state.node_id,
                n
            );
            return true;
        }
        n -= 1;
    }

    false
}

/// Create AppendEntries request for a specific follower
pub fn create_append_entries(raft_state: &RaftState, follower_id: NodeId) -> AppendEntriesRequest {
    let next_index = raft_state
        .next_index
        .get(&follower_id)
        .copied()
        .unwrap_or(raft_state.last_log_index() + 1)
        .max(1);

    let prev_log_index = next_index - 1;
    let prev_log_term = raft_state.term_at(prev_log_index).unwrap_or(0);

    AppendEntriesRequest {
        term: raft_state.current_term,
        leader_id: raft_state.node_id,
        prev_log_index,
        prev_log_term,
        entries: raft_state.entries_from(next_index),
        leader_commit: raft_state.commit_index,
    }
}
