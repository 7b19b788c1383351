//! Pure RPC handlers for the Raft protocol.
//!
//! Each handler takes the state under the caller's write guard, applies the
//! term-comparison and step-down rules, and produces the wire response.
//! Stale-term rejections are ordinary response payloads, never errors;
//! persistence and timer resets are the caller's concern.

use crate::proto::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::raft::state::{RaftRole, RaftState};

/// Handle RequestVote RPC.
///
/// Grants when the candidate's term is current and this node has not yet
/// voted for anyone else this term. The vote is recorded before the
/// response is built.
pub fn handle_request_vote(state: &mut RaftState, req: &VoteRequest) -> VoteResponse {
    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    let vote_granted = if req.term < state.current_term {
        false
    } else if state
        .voted_for
        .as_deref()
        .is_some_and(|v| v != req.candidate_id)
    {
        // Already voted for someone else in this term
        false
    } else {
        state.voted_for = Some(req.candidate_id.clone());
        true
    };

    tracing::debug!(
        node_id = %state.node_id,
        candidate = %req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    VoteResponse {
        term: state.current_term,
        vote_granted,
    }
}

/// Handle AppendEntries RPC.
///
/// A stale term is rejected with no state change. Otherwise the request
/// goes through the consistency-checked append; on acceptance the node is
/// a follower of the sending leader. The caller resets the election timer
/// when `success` is true.
pub fn handle_append_entries(
    state: &mut RaftState,
    req: &AppendEntriesRequest,
) -> AppendEntriesResponse {
    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    if req.term < state.current_term {
        return AppendEntriesResponse {
            term: state.current_term,
            success: false,
            match_index: state.last_log_index(),
        };
    }

    let success = state.append_with_consistency(
        req.prev_log_index,
        req.prev_log_term,
        &req.entries,
        req.term,
        req.leader_commit,
    );

    if success {
        if state.role != RaftRole::Follower {
            state.become_follower(req.term);
        }
        state.leader_id = Some(req.leader_id.clone());

        if !req.entries.is_empty() {
            tracing::debug!(
                node_id = %state.node_id,
                entries_appended = req.entries.len(),
                new_last_index = state.last_log_index(),
                "Appended entries"
            );
        }
    }

    AppendEntriesResponse {
        term: state.current_term,
        success,
        match_index: state.last_log_index(),
    }
}
