use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, LogEntry as ProtoLogEntry, VoteRequest,
    VoteResponse,
};
use crate::raft::state::{Command, LogEntry, RaftRole, RaftState};

/// Handle RequestVote RPC
pub fn handle_request_vote(state: &mut RaftState, req: &VoteRequest) -> VoteResponse {
    // A higher term demotes us before any other check.
    if req.term > state.current_term {
        state.become_follower(req.term);
    }

    if req.term < state.current_term {
        tracing::debug!(
            candidate = req.candidate_id,
            term = req.term,
            current_term = state.current_term,
            "rejecting vote request from stale term"
        );
        return VoteResponse {
            term: state.current_term,
            vote_granted: false,
        };
    }

    let can_vote = state.voted_for.is_none() || state.voted_for == Some(req.candidate_id);
    let granted = can_vote && state.is_log_up_to_date(req.last_log_index, req.last_log_term);

    if granted {
        state.voted_for = Some(req.candidate_id);
    }

    tracing::debug!(
        candidate = req.candidate_id,
        term = req.term,
        granted,
        "vote request handled"
    );

    VoteResponse {
        term: state.current_term,
        vote_granted: granted,
    }
}

/// Handle AppendEntries RPC
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
        };
    }

    // Contact from the current-term leader: a candidate yields, but the
    // vote cast this term stays recorded.
    if state.role != RaftRole::Follower {
        state.role = RaftRole::Follower;
    }
    state.leader_id = Some(req.leader_id);

    // Consistency check: our entry at prev_log_index must carry the
    // leader's prev_log_term. Index 0 is the pre-log sentinel and always
    // matches, so an empty log accepts entries from the beginning.
    if req.prev_log_index > 0 {
        match state.term_at(req.prev_log_index) {
            Some(term) if term == req.prev_log_term => {}
            _ => {
                tracing::debug!(
                    leader = req.leader_id,
                    prev_log_index = req.prev_log_index,
                    prev_log_term = req.prev_log_term,
                    last_log_index = state.last_log_index(),
                    "rejecting inconsistent append"
                );
                return AppendEntriesResponse {
                    term: state.current_term,
                    success: false,
                };
            }
        }
    }

    let entries: Vec<LogEntry> = req.entries.iter().map(entry_from_proto).collect();
    // Highest index this RPC has validated against the leader's log; the
    // commit index must not move past it.
    let last_new = req.prev_log_index + entries.len() as u64;

    if !entries.is_empty() {
        state.append_new_entries(req.prev_log_index, entries);
        tracing::debug!(
            leader = req.leader_id,
            count = req.entries.len(),
            last_log_index = state.last_log_index(),
            "appended entries"
        );
    }

    if req.leader_commit > state.commit_index {
        state.commit_index = req.leader_commit.min(last_new);
    }

    AppendEntriesResponse {
        term: state.current_term,
        success: true,
    }
}

/// Convert an internal entry to its wire form. Commands travel as an
/// opaque operation vector so consensus peers never interpret payloads.
pub fn entry_to_proto(entry: &LogEntry) -> ProtoLogEntry {
    let operation = match &entry.command {
        Command::Put { key, value } => vec!["PUT".to_string(), key.clone(), value.clone()],
        Command::Delete { key } => vec!["DEL".to_string(), key.clone()],
        Command::Noop => vec!["NO-OP".to_string()],
    };
    ProtoLogEntry {
        term: entry.term,
        operation,
    }
}

/// Convert a wire entry to its internal form. An operation this node
/// cannot decode still has to occupy its log index, so it degrades to a
/// no-op rather than shifting every entry after it.
pub fn entry_from_proto(proto: &ProtoLogEntry) -> LogEntry {
    let command = match proto.operation.as_slice() {
        [op, key, value] if op == "PUT" => Command::Put {
            key: key.clone(),
            value: value.clone(),
        },
        [op, key] if op == "DEL" => Command::Delete { key: key.clone() },
        [op] if op == "NO-OP" => Command::Noop,
        other => {
            tracing::warn!(operation = ?other, "unrecognized operation, treating as no-op");
            Command::Noop
        }
    };
    LogEntry {
        term: proto.term,
        command,
    }
}
