use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Commands replicated through the log. Consensus treats these as opaque
/// payloads; only the key-value state machine interprets them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Put { key: String, value: String },
    Delete { key: String },
    /// Leader-inserted entry carrying no client payload, appended on
    /// election win so prior-term entries can be committed.
    Noop,
}

/// A single entry in the Raft log. The entry's index is its 1-based
/// position in the log; index 0 is the pre-log sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub command: Command,
}

/// Shared replica state, guarded by the node's readers-writer lock.
///
/// # Safety invariants
///
/// - At most one leader per term: a replica votes at most once per term
///   (`voted_for`) and a candidate needs a majority to win.
/// - Log matching: the AppendEntries consistency check plus conflict
///   truncation keep logs identical up through any shared (index, term).
/// - Leader completeness: votes are only granted to candidates whose log
///   is at least as up-to-date, and `advance_commit_index` only commits
///   entries of the leader's own term directly.
/// - Monotonicity: `current_term`, `commit_index` and `last_applied` never
///   decrease; `last_applied <= commit_index` always.
#[derive(Debug)]
pub struct RaftState {
    // Persistent state, durable before any RPC reply that depends on it
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: Vec<LogEntry>,

    // Volatile state on all servers
    pub commit_index: u64,
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    pub next_index: HashMap<u64, u64>,
    pub match_index: HashMap<u64, u64>,

    pub role: RaftRole,

    // Known leader (if any)
    pub leader_id: Option<u64>,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            role: RaftRole::Follower,
            leader_id: None,
        }
    }

    /// Rebuild state from what the persister recovered; the replica
    /// resumes as a follower.
    pub fn restore(current_term: u64, voted_for: Option<u64>, log: Vec<LogEntry>) -> Self {
        Self {
            current_term,
            voted_for,
            log,
            ..Self::new()
        }
    }

    /// Index of the last log entry, 0 when the log is empty.
    pub fn last_log_index(&self) -> u64 {
        self.log.len() as u64
    }

    /// Term of the last log entry, 0 when the log is empty.
    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at `index`. `Some(0)` for the pre-log sentinel,
    /// `None` past the end of the log.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.log.get((index - 1) as usize).map(|e| e.term)
    }

    /// Get log entry at index (1-indexed)
    pub fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize)
    }

    /// Entries in `[from, to]`, both 1-indexed inclusive; clamped to the
    /// log's end, empty when `from > to`.
    pub fn entries_range(&self, from: u64, to: u64) -> Vec<LogEntry> {
        if from == 0 || from > to {
            return Vec::new();
        }
        let start = (from - 1) as usize;
        let end = (to as usize).min(self.log.len());
        if start >= end {
            return Vec::new();
        }
        self.log[start..end].to_vec()
    }

    /// Append a new entry under the current term, returning its index.
    pub fn append_entry(&mut self, command: Command) -> u64 {
        self.log.push(LogEntry {
            term: self.current_term,
            command,
        });
        self.last_log_index()
    }

    /// Drop the entry at `index` and everything after it.
    pub fn truncate_from(&mut self, index: u64) {
        if index == 0 {
            self.log.clear();
        } else {
            self.log.truncate((index - 1) as usize);
        }
    }

    /// Install entries following `prev_log_index`: an existing entry whose
    /// term conflicts truncates the suffix, entries already present are
    /// kept untouched, the rest are appended. A committed entry can never
    /// conflict, so it is never removed.
    pub fn append_new_entries(&mut self, prev_log_index: u64, entries: Vec<LogEntry>) {
        let mut index = prev_log_index;
        for entry in entries {
            index += 1;
            match self.term_at(index) {
                Some(existing) if existing == entry.term => continue,
                Some(_) => {
                    self.truncate_from(index);
                    self.log.push(entry);
                }
                None => self.log.push(entry),
            }
        }
    }

    /// Check if a candidate's log is at least as up-to-date as ours:
    /// higher last term wins, equal terms compare last index.
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_log_term();
        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= self.last_log_index())
    }

    /// Advance `commit_index` to the highest index stored on a majority
    /// (the leader counts itself), provided that entry carries the current
    /// term. Returns whether the index moved.
    pub fn advance_commit_index(&mut self, cluster_size: usize) -> bool {
        if self.role != RaftRole::Leader {
            return false;
        }

        let mut indices: Vec<u64> = self.match_index.values().copied().collect();
        indices.push(self.last_log_index());
        indices.sort_unstable();

        let majority = cluster_size / 2 + 1;
        if indices.len() < majority {
            return false;
        }
        // In the ascending list, this position and everything after it is
        // held by at least a majority of replicas.
        let candidate = indices[indices.len() - majority];

        if candidate > self.commit_index && self.term_at(candidate) == Some(self.current_term) {
            self.commit_index = candidate;
            return true;
        }
        false
    }

    /// Transition to follower at `term`, clearing the vote.
    pub fn become_follower(&mut self, term: u64) {
        self.role = RaftRole::Follower;
        self.current_term = term;
        self.voted_for = None;
        self.leader_id = None;
    }

    /// Transition to candidate: bump the term and vote for ourselves.
    pub fn become_candidate(&mut self, my_id: u64) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.leader_id = None;
    }

    /// Transition to leader: reinitialize per-peer progress so every peer
    /// starts probing from the end of our log.
    pub fn become_leader(&mut self, my_id: u64, peer_ids: &[u64]) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id);

        let next = self.last_log_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for &peer_id in peer_ids {
            self.next_index.insert(peer_id, next);
            self.match_index.insert(peer_id, 0);
        }
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}
