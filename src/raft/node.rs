use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{timeout, timeout_at, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};

use crate::config::NodeConfig;
use crate::error::{ReplikvError, Result};
use crate::proto::raft_service_client::RaftServiceClient;
use crate::proto::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::raft::rpc::{self, entry_to_proto};
use crate::raft::state::{Command, LogEntry, RaftRole, RaftState};
use crate::raft::timer::random_election_timeout;
use crate::storage::{Persister, StorageError};

/// Control messages for the Raft node event loop
#[derive(Debug)]
pub enum RaftMessage {
    /// Wakes the event loop after a role change so the new role's timer
    /// branch takes over without waiting out the old sleep.
    RoleChanged,
    /// Force an immediate election (test hook).
    TriggerElection,
}

/// The consensus node: one per replica.
///
/// All shared state lives behind a single readers-writer lock. The lock is
/// never held across an outbound RPC; every task revalidates role and term
/// after reacquiring it, so work started under a stale role discards
/// itself.
pub struct RaftNode {
    pub id: u64,
    pub state: Arc<RwLock<RaftState>>,
    config: NodeConfig,
    peers: Arc<Mutex<HashMap<u64, RaftServiceClient<Channel>>>>,
    persister: std::sync::Mutex<Persister>,
    message_tx: mpsc::Sender<RaftMessage>,
    /// Last contact from a valid leader (or vote grant); the election
    /// countdown measures from here.
    last_contact: Arc<RwLock<Instant>>,
    commit_tx: watch::Sender<u64>,
    shutdown: CancellationToken,
}

impl RaftNode {
    pub fn new(
        config: NodeConfig,
        shutdown: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<RaftMessage>)> {
        let (persister, recovered) = Persister::open(&config.data_dir)?;
        if recovered.current_term > 0 || !recovered.log.is_empty() {
            tracing::info!(
                node_id = config.node_id,
                term = recovered.current_term,
                voted_for = ?recovered.voted_for,
                log_len = recovered.log.len(),
                "recovered persistent state"
            );
        }
        let state = RaftState::restore(
            recovered.current_term,
            recovered.voted_for,
            recovered.log,
        );

        let (message_tx, message_rx) = mpsc::channel(100);
        let (commit_tx, _) = watch::channel(0u64);

        let node = Self {
            id: config.node_id,
            state: Arc::new(RwLock::new(state)),
            config,
            peers: Arc::new(Mutex::new(HashMap::new())),
            persister: std::sync::Mutex::new(persister),
            message_tx,
            last_contact: Arc::new(RwLock::new(Instant::now())),
            commit_tx,
            shutdown,
        };

        Ok((node, message_rx))
    }

    /// Get the message sender for external communication
    pub fn message_sender(&self) -> mpsc::Sender<RaftMessage> {
        self.message_tx.clone()
    }

    /// Watch channel tracking the commit index.
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    /// Set up client channels to all peers. Channels connect lazily, so a
    /// peer that is not up yet (or restarts later) is reached as soon as
    /// it starts listening.
    pub async fn connect_to_peers(&self) {
        let mut peers = self.peers.lock().await;
        for peer_config in &self.config.peers {
            let addr = format!("http://{}", peer_config.addr);
            match Endpoint::from_shared(addr.clone()) {
                Ok(endpoint) => {
                    let client = RaftServiceClient::new(endpoint.connect_lazy());
                    tracing::info!(peer_id = peer_config.node_id, addr = %addr, "Registered peer");
                    peers.insert(peer_config.node_id, client);
                }
                Err(e) => {
                    tracing::warn!(
                        peer_id = peer_config.node_id,
                        addr = %addr,
                        error = %e,
                        "Invalid peer address"
                    );
                }
            }
        }
    }

    /// Run the Raft node event loop: election countdown for followers and
    /// candidates, heartbeat cadence for leaders.
    pub async fn run(self: Arc<Self>, mut message_rx: mpsc::Receiver<RaftMessage>) {
        let mut election_timeout = self.fresh_election_timeout();
        let heartbeat = Duration::from_millis(self.config.heartbeat_interval_ms);

        loop {
            let role = self.state.read().await.role;

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!(node_id = self.id, "raft loop stopping");
                    break;
                }

                Some(msg) = message_rx.recv() => {
                    match msg {
                        // Just loop: the next iteration re-reads the role
                        // and arms the matching branch.
                        RaftMessage::RoleChanged => {}
                        RaftMessage::TriggerElection => {
                            self.start_election().await;
                            election_timeout = self.fresh_election_timeout();
                        }
                    }
                }

                // Election timeout (for followers and candidates)
                _ = tokio::time::sleep(election_timeout), if role != RaftRole::Leader => {
                    let elapsed = self.last_contact.read().await.elapsed();
                    if elapsed >= election_timeout {
                        tracing::info!(
                            node_id = self.id,
                            elapsed_ms = elapsed.as_millis(),
                            "election timeout"
                        );
                        self.start_election().await;
                    }
                    election_timeout = self.fresh_election_timeout();
                }

                // Heartbeat cadence (for leaders)
                _ = tokio::time::sleep(heartbeat), if role == RaftRole::Leader => {
                    self.broadcast_append().await;
                }
            }
        }
    }

    /// Become candidate and fan out vote requests to every peer.
    async fn start_election(self: &Arc<Self>) {
        let (term, last_log_index, last_log_term) = {
            let mut state = self.state.write().await;
            if state.role == RaftRole::Leader {
                return;
            }
            state.become_candidate(self.id);
            if self.persist_meta(&state).is_err() {
                return;
            }
            (
                state.current_term,
                state.last_log_index(),
                state.last_log_term(),
            )
        };
        self.reset_election_timer().await;

        tracing::info!(node_id = self.id, term, "starting election");

        // The candidate's own vote. With a single-node cluster it already
        // is a majority.
        let votes = Arc::new(AtomicU64::new(1));
        if self.config.majority() == 1 {
            let mut state = self.state.write().await;
            if state.role == RaftRole::Candidate && state.current_term == term {
                self.become_leader_locked(&mut state);
            }
            return;
        }

        let req = VoteRequest {
            term,
            candidate_id: self.id,
            last_log_index,
            last_log_term,
        };

        let peers = self.peers.lock().await.clone();
        for (peer_id, client) in peers {
            let node = self.clone();
            let votes = votes.clone();
            let req = req.clone();
            tokio::spawn(async move {
                node.request_vote_from(peer_id, client, req, votes).await;
            });
        }
    }

    /// Request one peer's vote and fold the reply into the tally.
    async fn request_vote_from(
        self: Arc<Self>,
        peer_id: u64,
        mut client: RaftServiceClient<Channel>,
        req: VoteRequest,
        votes: Arc<AtomicU64>,
    ) {
        let term = req.term;
        let resp = match timeout(self.rpc_timeout(), client.request_vote(req)).await {
            Ok(Ok(response)) => response.into_inner(),
            Ok(Err(e)) => {
                tracing::debug!(peer_id, error = %e, "vote request failed");
                return;
            }
            Err(_) => {
                tracing::debug!(peer_id, "vote request timed out");
                return;
            }
        };

        let mut state = self.state.write().await;

        if resp.term > state.current_term {
            state.become_follower(resp.term);
            if self.persist_meta(&state).is_err() {
                return;
            }
            drop(state);
            self.reset_election_timer().await;
            return;
        }

        // The election this reply belongs to may be long over.
        if state.role != RaftRole::Candidate || state.current_term != term {
            return;
        }

        if resp.vote_granted && resp.term == term {
            let tally = votes.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::debug!(node_id = self.id, peer_id, tally, "vote granted");

            // The write lock makes the transition exactly-once: the first
            // responder to see a majority flips the role, and every later
            // reply fails the candidate check above.
            if tally >= self.config.majority() as u64 {
                self.become_leader_locked(&mut state);
            }
        }
    }

    /// Finish an election win. Caller holds the write lock and has
    /// verified we are still the candidate of the winning term.
    fn become_leader_locked(self: &Arc<Self>, state: &mut RaftState) {
        let peer_ids: Vec<u64> = self.config.peers.iter().map(|p| p.node_id).collect();
        state.become_leader(self.id, &peer_ids);

        // No-op of the new term: commits everything before it once it is
        // majority-replicated.
        state.append_entry(Command::Noop);
        if self.persist_log(state).is_err() {
            return;
        }
        state.advance_commit_index(self.config.cluster_size());
        self.notify_commit(state);

        tracing::info!(
            node_id = self.id,
            term = state.current_term,
            last_log_index = state.last_log_index(),
            "won election, became leader"
        );

        // Wake the event loop onto the heartbeat cadence and push the
        // no-op out without waiting for the first tick.
        let _ = self.message_tx.try_send(RaftMessage::RoleChanged);
        let node = self.clone();
        tokio::spawn(async move {
            node.broadcast_append().await;
        });
    }

    /// Send one round of AppendEntries to every peer, carrying whatever
    /// each peer still misses (empty for peers that are caught up).
    async fn broadcast_append(self: &Arc<Self>) {
        let upper = {
            let state = self.state.read().await;
            if state.role != RaftRole::Leader {
                return;
            }
            state.last_log_index()
        };

        let peers = self.peers.lock().await.clone();
        for (peer_id, client) in peers {
            let node = self.clone();
            tokio::spawn(async move {
                node.replicate(peer_id, client, upper).await;
            });
        }
    }

    /// Drive one peer up to `upper_index`, backing `next_index` down past
    /// every rejection. The lock is released across each send; role and
    /// term are revalidated every time it is retaken.
    async fn replicate(
        self: Arc<Self>,
        peer_id: u64,
        mut client: RaftServiceClient<Channel>,
        upper_index: u64,
    ) {
        loop {
            let (req, term) = {
                let state = self.state.read().await;
                if state.role != RaftRole::Leader {
                    return;
                }
                let next = state
                    .next_index
                    .get(&peer_id)
                    .copied()
                    .unwrap_or(state.last_log_index() + 1);
                let prev_log_index = next.saturating_sub(1);
                let prev_log_term = state.term_at(prev_log_index).unwrap_or(0);
                let entries = state
                    .entries_range(next, upper_index)
                    .iter()
                    .map(entry_to_proto)
                    .collect();
                (
                    AppendEntriesRequest {
                        term: state.current_term,
                        leader_id: self.id,
                        prev_log_index,
                        prev_log_term,
                        entries,
                        leader_commit: state.commit_index,
                    },
                    state.current_term,
                )
            };

            let resp = match timeout(self.rpc_timeout(), client.append_entries(req)).await {
                Ok(Ok(response)) => response.into_inner(),
                Ok(Err(e)) => {
                    tracing::trace!(peer_id, error = %e, "append entries failed");
                    return;
                }
                Err(_) => {
                    tracing::trace!(peer_id, "append entries timed out");
                    return;
                }
            };

            let mut state = self.state.write().await;

            if resp.term > state.current_term {
                tracing::info!(
                    node_id = self.id,
                    peer_id,
                    term = resp.term,
                    "peer has higher term, stepping down"
                );
                state.become_follower(resp.term);
                if self.persist_meta(&state).is_err() {
                    return;
                }
                drop(state);
                self.reset_election_timer().await;
                let _ = self.message_tx.try_send(RaftMessage::RoleChanged);
                return;
            }

            if state.role != RaftRole::Leader || state.current_term != term {
                return;
            }

            if !resp.success {
                // Log inconsistency: probe one entry further back.
                match state.next_index.get_mut(&peer_id) {
                    Some(next) if *next > 1 => *next -= 1,
                    _ => return,
                }
                continue;
            }

            // Progress is monotone; a reordered older acknowledgement
            // must not drag it backwards.
            let matched = state.match_index.entry(peer_id).or_insert(0);
            if upper_index > *matched {
                *matched = upper_index;
            }
            let next = state.next_index.entry(peer_id).or_insert(1);
            if upper_index + 1 > *next {
                *next = upper_index + 1;
            }

            if state.advance_commit_index(self.config.cluster_size()) {
                tracing::debug!(
                    node_id = self.id,
                    commit_index = state.commit_index,
                    "advanced commit index"
                );
                self.notify_commit(&state);
            }
            return;
        }
    }

    /// Append a client command to the log and wait until a majority has
    /// stored it. Returns the entry's index on success; fails fast with
    /// the leader hint when this node is not the leader, and with a
    /// timeout or `NotLeader` when leadership is lost before the quorum.
    pub async fn propose(self: &Arc<Self>, command: Command) -> Result<u64> {
        let (term, index) = {
            let mut state = self.state.write().await;
            if state.role != RaftRole::Leader {
                return Err(ReplikvError::NotLeader(state.leader_id));
            }
            let index = state.append_entry(command);
            self.persist_log(&state).map_err(ReplikvError::Storage)?;
            // A single-node cluster commits on append.
            state.advance_commit_index(self.config.cluster_size());
            self.notify_commit(&state);
            (state.current_term, index)
        };

        tracing::debug!(node_id = self.id, index, term, "appended client command");

        // Replicate now instead of waiting out the heartbeat tick.
        let node = self.clone();
        tokio::spawn(async move {
            node.broadcast_append().await;
        });

        self.wait_for_commit(index, term).await?;
        Ok(index)
    }

    /// Block until the entry proposed at (`index`, `term`) is committed,
    /// or until leadership is lost or the deadline passes. One definite
    /// outcome per proposal.
    async fn wait_for_commit(&self, index: u64, term: u64) -> Result<()> {
        let mut commit_rx = self.commit_tx.subscribe();
        let deadline = Instant::now() + Duration::from_millis(self.config.proposal_timeout_ms);

        loop {
            if *commit_rx.borrow_and_update() >= index {
                let state = self.state.read().await;
                // The slot is committed; make sure it still holds our
                // entry and not one from a leader that replaced us.
                return if state.term_at(index) == Some(term) {
                    Ok(())
                } else {
                    Err(ReplikvError::NotLeader(state.leader_id))
                };
            }

            {
                let state = self.state.read().await;
                if state.role != RaftRole::Leader || state.current_term != term {
                    return Err(ReplikvError::NotLeader(state.leader_id));
                }
            }

            match timeout_at(deadline, commit_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(ReplikvError::ProposalTimeout),
                Err(_) => return Err(ReplikvError::ProposalTimeout),
            }
        }
    }

    /// Handle incoming RequestVote RPC
    pub async fn handle_vote_request(&self, req: VoteRequest) -> Result<VoteResponse> {
        let mut state = self.state.write().await;
        let meta_before = (state.current_term, state.voted_for);
        let was_leader = state.role == RaftRole::Leader;

        let resp = rpc::handle_request_vote(&mut state, &req);

        if (state.current_term, state.voted_for) != meta_before {
            self.persist_meta(&state).map_err(ReplikvError::Storage)?;
        }
        let stepped_down = was_leader && state.role != RaftRole::Leader;
        drop(state);

        // Granting a vote is leader-ish contact: the candidate deserves a
        // full election timeout to win before we run against it. A leader
        // demoted by a higher term restarts its countdown from scratch.
        if resp.vote_granted || stepped_down {
            self.reset_election_timer().await;
        }
        if stepped_down {
            let _ = self.message_tx.try_send(RaftMessage::RoleChanged);
        }

        Ok(resp)
    }

    /// Handle incoming AppendEntries RPC
    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let mut state = self.state.write().await;
        let meta_before = (state.current_term, state.voted_for);
        let was_leader = state.role == RaftRole::Leader;
        let entries_offered = !req.entries.is_empty();

        let resp = rpc::handle_append_entries(&mut state, &req);

        if (state.current_term, state.voted_for) != meta_before {
            self.persist_meta(&state).map_err(ReplikvError::Storage)?;
        }
        if resp.success && entries_offered {
            self.persist_log(&state).map_err(ReplikvError::Storage)?;
        }
        self.notify_commit(&state);

        // Any message from the current-term leader resets the countdown,
        // including consistency-check rejections.
        let valid_leader = req.term == state.current_term;
        let stepped_down = was_leader && state.role != RaftRole::Leader;
        drop(state);

        if valid_leader {
            self.reset_election_timer().await;
        }
        if stepped_down {
            let _ = self.message_tx.try_send(RaftMessage::RoleChanged);
        }

        Ok(resp)
    }

    /// Drain entries that are committed but not yet applied, advancing
    /// `last_applied`. Returns `(index, entry)` pairs in index order.
    pub async fn get_committed_entries(&self) -> Vec<(u64, LogEntry)> {
        let mut state = self.state.write().await;
        let mut entries = Vec::new();

        while state.last_applied < state.commit_index {
            let index = state.last_applied + 1;
            if let Some(entry) = state.entry_at(index) {
                entries.push((index, entry.clone()));
            }
            state.last_applied = index;
        }

        entries
    }

    /// Check if this node is the leader
    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == RaftRole::Leader
    }

    /// Get the current leader ID, if known
    pub async fn leader_id(&self) -> Option<u64> {
        self.state.read().await.leader_id
    }

    fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.config.rpc_timeout_ms)
    }

    fn fresh_election_timeout(&self) -> Duration {
        random_election_timeout(
            self.config.election_timeout_min_ms,
            self.config.election_timeout_max_ms,
        )
    }

    async fn reset_election_timer(&self) {
        *self.last_contact.write().await = Instant::now();
    }

    /// Publish the commit index to the apply loop and pending proposals.
    fn notify_commit(&self, state: &RaftState) {
        let commit_index = state.commit_index;
        self.commit_tx.send_if_modified(|current| {
            if commit_index > *current {
                *current = commit_index;
                true
            } else {
                false
            }
        });
    }

    /// Flush term and vote to stable storage. A failure is fatal: the
    /// node stops participating rather than respond on unsaved state.
    fn persist_meta(&self, state: &RaftState) -> std::result::Result<(), StorageError> {
        let result = self
            .persister
            .lock()
            .expect("persister mutex poisoned")
            .save_meta(state.current_term, state.voted_for);
        if let Err(e) = &result {
            tracing::error!(node_id = self.id, error = %e, "failed to persist metadata, halting");
            self.shutdown.cancel();
        }
        result
    }

    /// Flush the log to stable storage. Failure is fatal, as above.
    fn persist_log(&self, state: &RaftState) -> std::result::Result<(), StorageError> {
        let result = self
            .persister
            .lock()
            .expect("persister mutex poisoned")
            .save_log(&state.log);
        if let Err(e) = &result {
            tracing::error!(node_id = self.id, error = %e, "failed to persist log, halting");
            self.shutdown.cancel();
        }
        result
    }
}
