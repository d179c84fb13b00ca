//! Unit tests for the server side of RequestVote and AppendEntries.

use replikv::proto::{AppendEntriesRequest, LogEntry as ProtoLogEntry, VoteRequest};
use replikv::raft::rpc::{handle_append_entries, handle_request_vote};
use replikv::raft::{Command, LogEntry, RaftRole, RaftState};

fn proto_entry(term: u64, key: &str, value: &str) -> ProtoLogEntry {
    ProtoLogEntry {
        term,
        operation: vec!["PUT".to_string(), key.to_string(), value.to_string()],
    }
}

fn proto_noop(term: u64) -> ProtoLogEntry {
    ProtoLogEntry {
        term,
        operation: vec!["NO-OP".to_string()],
    }
}

fn heartbeat(term: u64, leader_id: u64, prev_log_index: u64, prev_log_term: u64) -> AppendEntriesRequest {
    AppendEntriesRequest {
        term,
        leader_id,
        prev_log_index,
        prev_log_term,
        entries: vec![],
        leader_commit: 0,
    }
}

#[test]
fn test_request_vote_grant() {
    let mut state = RaftState::new();
    state.current_term = 1;

    let req = VoteRequest {
        term: 2,
        candidate_id: 2,
        last_log_index: 0,
        last_log_term: 0,
    };

    let resp = handle_request_vote(&mut state, &req);

    assert!(resp.vote_granted);
    assert_eq!(resp.term, 2);
    assert_eq!(state.voted_for, Some(2));
    assert_eq!(state.current_term, 2);
}

#[test]
fn test_request_vote_reject_stale_term() {
    let mut state = RaftState::new();
    state.current_term = 5;

    let req = VoteRequest {
        term: 3,
        candidate_id: 2,
        last_log_index: 0,
        last_log_term: 0,
    };

    let resp = handle_request_vote(&mut state, &req);

    assert!(!resp.vote_granted);
    assert_eq!(resp.term, 5);
    assert_eq!(state.voted_for, None);
}

#[test]
fn test_vote_uniqueness_within_term() {
    let mut state = RaftState::new();

    let first = VoteRequest {
        term: 1,
        candidate_id: 2,
        last_log_index: 0,
        last_log_term: 0,
    };
    let second = VoteRequest {
        term: 1,
        candidate_id: 3,
        last_log_index: 0,
        last_log_term: 0,
    };

    assert!(handle_request_vote(&mut state, &first).vote_granted);
    assert!(!handle_request_vote(&mut state, &second).vote_granted);
    assert_eq!(state.voted_for, Some(2));

    // The same candidate asking again gets the same answer.
    assert!(handle_request_vote(&mut state, &first).vote_granted);
}

#[test]
fn test_request_vote_reject_outdated_log() {
    let mut state = RaftState::new();
    state.current_term = 2;
    state.log.push(LogEntry {
        term: 2,
        command: Command::Noop,
    });

    // Candidate with an empty log cannot win our vote.
    let req = VoteRequest {
        term: 3,
        candidate_id: 2,
        last_log_index: 0,
        last_log_term: 0,
    };

    let resp = handle_request_vote(&mut state, &req);

    assert!(!resp.vote_granted);
    // The higher term is adopted even though the vote was denied.
    assert_eq!(state.current_term, 3);
}

#[test]
fn test_request_vote_compares_term_before_length() {
    let mut state = RaftState::new();
    state.current_term = 3;
    state.log.push(LogEntry {
        term: 1,
        command: Command::Noop,
    });
    state.log.push(LogEntry {
        term: 1,
        command: Command::Noop,
    });

    // Shorter log but higher last term is more up-to-date.
    let req = VoteRequest {
        term: 4,
        candidate_id: 2,
        last_log_index: 1,
        last_log_term: 3,
    };

    assert!(handle_request_vote(&mut state, &req).vote_granted);
}

#[test]
fn test_leader_steps_down_on_higher_term_vote_request() {
    let mut state = RaftState::new();
    state.become_candidate(1);
    state.current_term = 3;
    state.become_leader(1, &[2, 3]);

    let req = VoteRequest {
        term: 7,
        candidate_id: 2,
        last_log_index: 0,
        last_log_term: 0,
    };

    let resp = handle_request_vote(&mut state, &req);

    assert_eq!(state.role, RaftRole::Follower);
    assert_eq!(state.current_term, 7);
    assert!(resp.vote_granted);
    assert_eq!(state.voted_for, Some(2));
}

#[test]
fn test_append_entries_heartbeat_accepted() {
    let mut state = RaftState::new();
    state.current_term = 1;

    let resp = handle_append_entries(&mut state, &heartbeat(1, 2, 0, 0));

    assert!(resp.success);
    assert_eq!(resp.term, 1);
    assert_eq!(state.leader_id, Some(2));
}

#[test]
fn test_append_entries_reject_stale_term() {
    let mut state = RaftState::new();
    state.current_term = 5;

    let resp = handle_append_entries(&mut state, &heartbeat(3, 2, 0, 0));

    assert!(!resp.success);
    assert_eq!(resp.term, 5);
    // A stale leader is not adopted.
    assert_eq!(state.leader_id, None);
}

#[test]
fn test_append_entries_empty_log_sentinel_accepted() {
    let mut state = RaftState::new();

    // prev_log_index 0 against an empty log always passes the check.
    let req = AppendEntriesRequest {
        term: 1,
        leader_id: 2,
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![proto_noop(1)],
        leader_commit: 0,
    };

    let resp = handle_append_entries(&mut state, &req);

    assert!(resp.success);
    assert_eq!(state.last_log_index(), 1);
}

#[test]
fn test_append_entries_reject_missing_prev() {
    let mut state = RaftState::new();
    state.current_term = 1;

    let resp = handle_append_entries(&mut state, &heartbeat(1, 2, 5, 1));

    assert!(!resp.success);
}

#[test]
fn test_append_entries_reject_prev_term_mismatch() {
    let mut state = RaftState::new();
    state.current_term = 2;
    state.log.push(LogEntry {
        term: 1,
        command: Command::Noop,
    });

    let resp = handle_append_entries(&mut state, &heartbeat(2, 2, 1, 2));

    assert!(!resp.success);
    // Rejection does not touch the log; truncation happens on accept.
    assert_eq!(state.last_log_index(), 1);
}

#[test]
fn test_append_entries_conflict_truncation() {
    // Follower log: [(t1,a), (t2,b), (t2,c)]; the leader sends
    // (t3,b'), (t3,d) following index 1. The follower truncates from
    // index 2 and ends with [(t1,a), (t3,b'), (t3,d)].
    let mut state = RaftState::new();
    state.current_term = 1;
    state.append_entry(Command::Put {
        key: "a".into(),
        value: "1".into(),
    });
    state.current_term = 2;
    state.append_entry(Command::Put {
        key: "b".into(),
        value: "2".into(),
    });
    state.append_entry(Command::Put {
        key: "c".into(),
        value: "3".into(),
    });

    let req = AppendEntriesRequest {
        term: 3,
        leader_id: 2,
        prev_log_index: 1,
        prev_log_term: 1,
        entries: vec![proto_entry(3, "b", "2'"), proto_entry(3, "d", "4")],
        leader_commit: 0,
    };

    let resp = handle_append_entries(&mut state, &req);

    assert!(resp.success);
    assert_eq!(state.last_log_index(), 3);
    assert_eq!(state.term_at(1), Some(1));
    assert_eq!(state.term_at(2), Some(3));
    assert_eq!(state.term_at(3), Some(3));
    assert_eq!(
        state.entry_at(2).unwrap().command,
        Command::Put {
            key: "b".into(),
            value: "2'".into()
        }
    );
}

#[test]
fn test_append_entries_duplicate_delivery_is_noop() {
    let mut state = RaftState::new();

    let req = AppendEntriesRequest {
        term: 1,
        leader_id: 2,
        prev_log_index: 0,
        prev_log_term: 0,
        entries: vec![proto_entry(1, "k", "v"), proto_noop(1)],
        leader_commit: 0,
    };

    assert!(handle_append_entries(&mut state, &req).success);
    assert!(handle_append_entries(&mut state, &req).success);

    assert_eq!(state.last_log_index(), 2);
}

#[test]
fn test_append_entries_updates_commit_index() {
    let mut state = RaftState::new();
    state.current_term = 1;
    state.log.push(LogEntry {
        term: 1,
        command: Command::Noop,
    });

    let mut req = heartbeat(1, 2, 1, 1);
    req.leader_commit = 1;

    let resp = handle_append_entries(&mut state, &req);

    assert!(resp.success);
    assert_eq!(state.commit_index, 1);
}

#[test]
fn test_commit_index_clamped_to_validated_prefix() {
    let mut state = RaftState::new();
    state.current_term = 1;
    state.log.push(LogEntry {
        term: 1,
        command: Command::Noop,
    });
    state.log.push(LogEntry {
        term: 1,
        command: Command::Noop,
    });

    // The leader has committed far ahead, but this RPC only vouches for
    // entries up to index 1; our index-2 entry might diverge.
    let mut req = heartbeat(1, 2, 1, 1);
    req.leader_commit = 5;

    let resp = handle_append_entries(&mut state, &req);

    assert!(resp.success);
    assert_eq!(state.commit_index, 1);
}

#[test]
fn test_candidate_yields_to_current_term_leader() {
    let mut state = RaftState::new();
    state.become_candidate(1); // candidate in term 1

    let resp = handle_append_entries(&mut state, &heartbeat(1, 2, 0, 0));

    assert!(resp.success);
    assert_eq!(state.role, RaftRole::Follower);
    // Yielding within the same term keeps the self-vote recorded.
    assert_eq!(state.voted_for, Some(1));
    assert_eq!(state.leader_id, Some(2));
}

#[test]
fn test_append_entries_higher_term_demotes() {
    let mut state = RaftState::new();
    state.become_candidate(1);

    let resp = handle_append_entries(&mut state, &heartbeat(5, 2, 0, 0));

    assert!(resp.success);
    assert_eq!(state.current_term, 5);
    assert_eq!(state.role, RaftRole::Follower);
    assert_eq!(state.voted_for, None);
}
