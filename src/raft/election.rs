use super::rpc::{RequestVoteRequest, RequestVoteResponse};
use super::state::RaftState;
use super::types::{NodeId, Term};
use crate::storage::StateStorage;
use crate::util::errors::Result;

/// Handle incoming RequestVote RPC.
///
/// The term and vote are persisted before the response is returned, so a
/// restarted node cannot vote twice in the same term.
pub fn handle_request_vote<S: StateStorage + ?Sized>(
    raft_state: &mut RaftState,
    state_storage: &mut S,
    request: RequestVoteRequest,
) -> Result<RequestVoteResponse> {
    tracing::debug!(
        "Node {} received RequestVote from {} (term: {})",
        raft_state.node_id,
        request.candidate_id,
        request.term
    );

    // If request term is greater, update our term and become follower
    let term_changed = raft_state.update_term(request.term);

    let mut vote_granted = false;

    // Grant vote if:
    // 1. Candidate's term is at least as current as ours
    // 2. We haven't voted yet in this term, or we already voted for this candidate
    // 3. Candidate's log is at least as up-to-date as ours
    if request.term == raft_state.current_term {
        let can_vote = raft_state.voted_for.is_none()
            || raft_state.voted_for == Some(request.candidate_id);

        if can_vote {
            if raft_state.is_log_up_to_date(request.last_log_index, request.last_log_term) {
                vote_granted = true;
                raft_state.voted_for = Some(request.candidate_id);
                raft_state.reset_election_timer();

                tracing::info!(
                    "Node {} granted vote to {} in term {}",
                    raft_state.node_id,
                    request.candidate_id,
                    request.term
                );
            } else {
                tracing::debug!(
                    "Node {} denied vote to {} - log not up-to-date",
                    raft_state.node_id,
                    request.candidate_id
                );
            }
        } else {
            tracing::debug!(
                "Node {} denied vote to {} - already voted for {:?}",
                raft_state.node_id,
                request.candidate_id,
                raft_state.voted_for
            );
        }
    } else {
        tracing::debug!(
            "Node {} denied vote to {} - request term {} < current term {}",
            raft_state.node_id,
            request.candidate_id,
            request.term,
            raft_state.current_term
        );
    }

    if term_changed || vote_granted {
        state_storage.save_state(&raft_state.hard_state())?;
    }

    Ok(RequestVoteResponse {
        term: raft_state.current_term,
        vote_granted,
    })
}

/// Count one RequestVote response for the election started in
/// `election_term`. Returns true once this node holds a majority of
/// `cluster_size` votes.
pub fn handle_request_vote_response(
    raft_state: &mut RaftState,
    from: NodeId,
    election_term: Term,
    response: RequestVoteResponse,
    cluster_size: usize,
) -> bool {
    // If response term is greater, update our term and become follower
    if raft_state.update_term(response.term) {
        return false;
    }

    // Ignore if we're not a candidate anymore, or the election moved on
    if !raft_state.is_candidate() || raft_state.current_term != election_term {
        return false;
    }

    // Ignore stale responses
    if response.term < raft_state.current_term {
        return false;
    }

    if response.vote_granted {
        raft_state.add_vote(from);

        tracing::debug!(
            "Node {} received vote from {} ({}/{} votes)",
            raft_state.node_id,
            from,
            raft_state.votes_received.len(),
            cluster_size
        );

        if raft_state.has_majority(cluster_size) {
            tracing::info!(
                "Node {} won election in term {} with {} votes",
                raft_state.node_id,
                raft_state.current_term,
                raft_state.votes_received.len()
            );
            return true;
        }
    }

    false
}

/// Create a RequestVote request for this node
pub fn create_request_vote(raft_state: &RaftState) -> RequestVoteRequest {
    RequestVoteRequest {
        term: raft_state.current_term,
        candidate_id: raft_state.node_id,
        last_log_index: raft_state.last_log_index(),
        last_log_term: raft_state.last_log_term(),
    }
}
