use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify, RwLock};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use crate::config::NodeConfig;
use crate::error::{ReplogError, Result};
use crate::proto::raft_service_client::RaftServiceClient;
use crate::proto::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::raft::rpc;
use crate::raft::state::{RaftRole, RaftState};
use crate::raft::timer::random_election_timeout;
use crate::storage::StateFile;

/// Per-RPC deadline. An unanswered peer counts as a silent non-response.
const RPC_TIMEOUT: Duration = Duration::from_millis(100);

/// Message types for the Raft node event loop
#[derive(Debug)]
pub enum RaftMessage {
    /// Request to append a client command to the log (leader only)
    AppendCommand {
        command: String,
        response_tx: oneshot::Sender<Result<u64>>,
    },
}

/// The main Raft node that coordinates consensus.
///
/// All consensus state lives behind one `RwLock`; each logical operation
/// (a timer firing, a vote tally, an inbound RPC) takes the write guard
/// once, mutates everything it needs, persists, and releases. Network I/O
/// never happens while the guard is held.
pub struct RaftNode {
    pub id: String,
    pub state: Arc<RwLock<RaftState>>,
    config: NodeConfig,
    peers: Mutex<HashMap<String, RaftServiceClient<Channel>>>,
    /// Peers we pretend are unreachable (partition simulation in tests)
    disconnected: RwLock<HashSet<String>>,
    message_tx: mpsc::Sender<RaftMessage>,
    last_heartbeat: RwLock<Instant>,
    commit_tx: watch::Sender<u64>,
    /// Wakes the event loop when a spawned task changes the role
    role_changed: Notify,
    storage: Option<Arc<StateFile>>,
}

impl RaftNode {
    /// Create a node, recovering durable state from `storage` when present.
    /// With `None` all state is volatile (tests only).
    pub fn new(
        config: NodeConfig,
        storage: Option<StateFile>,
    ) -> Result<(Self, mpsc::Receiver<RaftMessage>)> {
        let state = match &storage {
            Some(file) => match file.load()? {
                Some(persisted) => {
                    tracing::info!(
                        node_id = %config.node_id,
                        term = persisted.current_term,
                        entries = persisted.entries.len(),
                        "Recovered persisted state"
                    );
                    RaftState::restore(config.node_id.clone(), persisted)
                }
                None => RaftState::new(config.node_id.clone()),
            },
            None => RaftState::new(config.node_id.clone()),
        };

        let (message_tx, message_rx) = mpsc::channel(100);
        let (commit_tx, _) = watch::channel(0u64);

        let node = Self {
            id: config.node_id.clone(),
            state: Arc::new(RwLock::new(state)),
            config,
            peers: Mutex::new(HashMap::new()),
            disconnected: RwLock::new(HashSet::new()),
            message_tx,
            last_heartbeat: RwLock::new(Instant::now()),
            commit_tx,
            role_changed: Notify::new(),
            storage: storage.map(Arc::new),
        };

        Ok((node, message_rx))
    }

    /// Get the message sender for external communication
    pub fn message_sender(&self) -> mpsc::Sender<RaftMessage> {
        self.message_tx.clone()
    }

    /// Watch the commit index. The receiver is notified whenever it grows.
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    /// Eagerly connect to all peers. Peers that are not up yet are retried
    /// lazily on the next send to them.
    pub async fn connect_to_peers(&self) {
        for peer in &self.config.peers {
            if self.get_or_connect(&peer.node_id, &peer.addr).await.is_some() {
                tracing::info!(node_id = %self.id, peer = %peer.node_id, addr = %peer.addr, "Connected to peer");
            } else {
                tracing::warn!(node_id = %self.id, peer = %peer.node_id, addr = %peer.addr, "Failed to connect to peer");
            }
        }
    }

    /// Suppress all traffic to a peer, simulating a network partition.
    pub async fn disconnect_peer(&self, peer_id: &str) {
        self.disconnected.write().await.insert(peer_id.to_string());
        self.peers.lock().await.remove(peer_id);
    }

    /// Undo `disconnect_peer`; the connection is re-established lazily.
    pub async fn reconnect_peer(&self, peer_id: &str) {
        self.disconnected.write().await.remove(peer_id);
    }

    async fn get_or_connect(
        &self,
        peer_id: &str,
        peer_addr: &str,
    ) -> Option<RaftServiceClient<Channel>> {
        if self.disconnected.read().await.contains(peer_id) {
            return None;
        }
        if let Some(client) = self.peers.lock().await.get(peer_id) {
            return Some(client.clone());
        }

        let uri = format!("http://{}", peer_addr);
        match timeout(RPC_TIMEOUT, RaftServiceClient::connect(uri)).await {
            Ok(Ok(client)) => {
                self.peers
                    .lock()
                    .await
                    .insert(peer_id.to_string(), client.clone());
                Some(client)
            }
            Ok(Err(e)) => {
                tracing::trace!(node_id = %self.id, peer = %peer_id, error = %e, "Peer connect failed");
                None
            }
            Err(_) => {
                tracing::trace!(node_id = %self.id, peer = %peer_id, "Peer connect timed out");
                None
            }
        }
    }

    fn peer_ids(&self) -> Vec<String> {
        self.config.peers.iter().map(|p| p.node_id.clone()).collect()
    }

    /// Run the Raft node event loop until `shutdown` is cancelled.
    pub async fn run(
        self: &Arc<Self>,
        mut message_rx: mpsc::Receiver<RaftMessage>,
        shutdown: CancellationToken,
    ) {
        let mut election_timeout = random_election_timeout(
            self.config.election_timeout_min_ms,
            self.config.election_timeout_max_ms,
        );

        loop {
            let role = self.state.read().await.role;

            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(node_id = %self.id, "Raft event loop stopping");
                    break;
                }

                // A spawned vote or replication task changed our role;
                // re-evaluate which timers apply.
                _ = self.role_changed.notified() => {}

                Some(msg) = message_rx.recv() => {
                    match msg {
                        RaftMessage::AppendCommand { command, response_tx } => {
                            let result = self.append_command(command).await;
                            let _ = response_tx.send(result);
                        }
                    }
                }

                // Election countdown (followers and candidates). An accepted
                // AppendEntries moves `last_heartbeat`, voiding the pending
                // fire; the timeout is redrawn on every rearm.
                _ = tokio::time::sleep(election_timeout), if role != RaftRole::Leader => {
                    let elapsed = self.last_heartbeat.read().await.elapsed();
                    if elapsed >= election_timeout {
                        tracing::info!(
                            node_id = %self.id,
                            elapsed_ms = elapsed.as_millis(),
                            "Election timeout, starting election"
                        );
                        self.start_election().await;
                    }
                    election_timeout = random_election_timeout(
                        self.config.election_timeout_min_ms,
                        self.config.election_timeout_max_ms,
                    );
                }

                // Heartbeat interval (leaders)
                _ = tokio::time::sleep(Duration::from_millis(self.config.heartbeat_interval_ms)), if role == RaftRole::Leader => {
                    self.send_heartbeats().await;
                }
            }
        }
    }

    /// Open a new election round: bump the term, vote for self, and fan
    /// vote requests out to every peer as independent tasks so one slow or
    /// dead peer never delays the others.
    async fn start_election(self: &Arc<Self>) {
        let request = {
            let mut state = self.state.write().await;
            // A concurrent vote tally may have promoted us already
            if state.role == RaftRole::Leader {
                return;
            }
            state.become_candidate();
            if let Err(e) = self.persist(&state) {
                tracing::error!(
                    node_id = %self.id,
                    error = %e,
                    "Failed to persist candidate state, abandoning election round"
                );
                return;
            }
            tracing::info!(node_id = %self.id, term = state.current_term, "Starting election");
            VoteRequest {
                term: state.current_term,
                candidate_id: self.id.clone(),
            }
        };

        let term = request.term;
        let majority = self.config.majority();

        // A single-node cluster wins on its own vote
        if self.config.peers.is_empty() {
            let mut state = self.state.write().await;
            if state.role == RaftRole::Candidate && state.current_term == term {
                state.become_leader(&[]);
                self.persist_or_log(&state);
                tracing::info!(node_id = %self.id, term, "Became leader");
            }
            return;
        }

        for peer in &self.config.peers {
            let node = Arc::clone(self);
            let peer_id = peer.node_id.clone();
            let peer_addr = peer.addr.clone();
            let request = request.clone();
            tokio::spawn(async move {
                node.request_vote_from_peer(peer_id, peer_addr, request, term, majority)
                    .await;
            });
        }
    }

    /// One outbound vote request. On grant, tallies the vote under the
    /// state lock and takes leadership on the first quorum; later grants
    /// for the same round find the role already Leader and do nothing.
    async fn request_vote_from_peer(
        self: Arc<Self>,
        peer_id: String,
        peer_addr: String,
        request: VoteRequest,
        term: u64,
        majority: u64,
    ) {
        let Some(mut client) = self.get_or_connect(&peer_id, &peer_addr).await else {
            return;
        };

        match timeout(RPC_TIMEOUT, client.request_vote(request)).await {
            Ok(Ok(response)) => {
                let resp = response.into_inner();
                let won = {
                    let mut state = self.state.write().await;

                    if resp.term > state.current_term {
                        state.become_follower(resp.term);
                        self.persist_or_log(&state);
                        return;
                    }

                    // Stale round or already decided
                    if !resp.vote_granted
                        || state.role != RaftRole::Candidate
                        || state.current_term != term
                    {
                        return;
                    }

                    state.votes_received += 1;
                    tracing::debug!(
                        node_id = %self.id,
                        peer = %peer_id,
                        votes = state.votes_received,
                        "Received vote"
                    );

                    if state.votes_received >= majority {
                        let peer_ids = self.peer_ids();
                        state.become_leader(&peer_ids);
                        self.persist_or_log(&state);
                        tracing::info!(
                            node_id = %self.id,
                            term,
                            votes = state.votes_received,
                            "Became leader"
                        );
                        true
                    } else {
                        false
                    }
                };

                if won {
                    // Assert leadership before followers time out again
                    self.send_heartbeats().await;
                    self.role_changed.notify_one();
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(node_id = %self.id, peer = %peer_id, error = %e, "Vote request failed");
            }
            Err(_) => {
                tracing::warn!(node_id = %self.id, peer = %peer_id, "Vote request timed out");
            }
        }
    }

    /// One replication cycle: build a per-peer AppendEntries batch under
    /// the read guard, then ship each batch from its own task.
    async fn send_heartbeats(self: &Arc<Self>) {
        let batches = {
            let state = self.state.read().await;
            if state.role != RaftRole::Leader {
                return;
            }

            let last_index = state.last_log_index();
            self.config
                .peers
                .iter()
                .map(|peer| {
                    let next = state.next_index_for(&peer.node_id);
                    let prev_log_index = next.saturating_sub(1);
                    let entries = if next <= last_index {
                        state.commands_from_to(next, last_index)
                    } else {
                        Vec::new()
                    };
                    let request = AppendEntriesRequest {
                        term: state.current_term,
                        leader_id: self.id.clone(),
                        prev_log_index,
                        prev_log_term: state.term_at(prev_log_index),
                        entries,
                        leader_commit: state.commit_index,
                    };
                    (peer.node_id.clone(), peer.addr.clone(), request)
                })
                .collect::<Vec<_>>()
        };

        for (peer_id, peer_addr, request) in batches {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                node.replicate_to_peer(peer_id, peer_addr, request).await;
            });
        }
    }

    async fn replicate_to_peer(
        self: Arc<Self>,
        peer_id: String,
        peer_addr: String,
        request: AppendEntriesRequest,
    ) {
        let Some(mut client) = self.get_or_connect(&peer_id, &peer_addr).await else {
            return;
        };

        let is_heartbeat = request.entries.is_empty();
        match timeout(RPC_TIMEOUT, client.append_entries(request)).await {
            Ok(Ok(response)) => {
                let resp = response.into_inner();
                let commit_index = {
                    let mut state = self.state.write().await;

                    if resp.term > state.current_term {
                        tracing::info!(
                            node_id = %self.id,
                            term = resp.term,
                            "Follower has higher term, stepping down"
                        );
                        state.become_follower(resp.term);
                        self.persist_or_log(&state);
                        self.role_changed.notify_one();
                        return;
                    }

                    if state.role != RaftRole::Leader {
                        return;
                    }

                    if resp.success {
                        state.update_follower_progress(&peer_id, resp.match_index);
                    } else {
                        // Log mismatch; back off one step and retry next tick
                        state.decrement_next_index(&peer_id);
                    }
                    state.commit_index
                };
                self.publish_commit(commit_index);
            }
            Ok(Err(e)) => {
                tracing::trace!(node_id = %self.id, peer = %peer_id, is_heartbeat, error = %e, "AppendEntries failed");
            }
            Err(_) => {
                tracing::trace!(node_id = %self.id, peer = %peer_id, is_heartbeat, "AppendEntries timed out");
            }
        }
    }

    /// Append a client command to the leader's log. The entry is durable
    /// on the leader when this returns; replication to followers rides the
    /// next heartbeat cycle, and the commit cursor moves only once a
    /// majority acknowledges the entry.
    async fn append_command(&self, command: String) -> Result<u64> {
        let mut state = self.state.write().await;

        if state.role != RaftRole::Leader {
            return Err(ReplogError::NotLeader(state.leader_id.clone()));
        }

        let term = state.current_term;
        let prev_index = state.last_log_index();
        state.append_entries(prev_index, std::slice::from_ref(&command), term);
        self.persist(&state)?;

        let index = state.last_log_index();
        tracing::debug!(node_id = %self.id, index, term, "Appended client command");
        Ok(index)
    }

    /// Handle incoming RequestVote RPC
    pub async fn handle_vote_request(&self, req: VoteRequest) -> Result<VoteResponse> {
        let mut state = self.state.write().await;
        let before = durable_fingerprint(&state);
        let response = rpc::handle_request_vote(&mut state, &req);
        if durable_fingerprint(&state) != before {
            self.persist(&state)?;
        }
        Ok(response)
    }

    /// Handle incoming AppendEntries RPC
    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let (response, commit_index) = {
            let mut state = self.state.write().await;
            let before = durable_fingerprint(&state);
            let response = rpc::handle_append_entries(&mut state, &req);
            if durable_fingerprint(&state) != before {
                self.persist(&state)?;
            }
            (response, state.commit_index)
        };

        // An accepted AppendEntries from the current leader resets the
        // election countdown
        if response.success {
            *self.last_heartbeat.write().await = Instant::now();
        }
        self.publish_commit(commit_index);

        Ok(response)
    }

    /// Check if this node is the leader
    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == RaftRole::Leader
    }

    /// Get the current leader ID, as far as this node knows
    pub async fn get_leader_id(&self) -> Option<String> {
        let state = self.state.read().await;
        if state.role == RaftRole::Leader {
            Some(self.id.clone())
        } else {
            state.leader_id.clone()
        }
    }

    fn persist(&self, state: &RaftState) -> Result<()> {
        if let Some(storage) = &self.storage {
            storage.save(&state.to_persisted())?;
        }
        Ok(())
    }

    fn persist_or_log(&self, state: &RaftState) {
        if let Err(e) = self.persist(state) {
            tracing::error!(node_id = %self.id, error = %e, "Failed to persist state");
        }
    }

    fn publish_commit(&self, commit_index: u64) {
        self.commit_tx.send_if_modified(|current| {
            if commit_index > *current {
                *current = commit_index;
                true
            } else {
                false
            }
        });
    }
}

/// The fields whose mutation requires a synchronous write to the state
/// file: term, vote, known leader, and the log (length + tail term pin
/// down every reachable log mutation).
fn durable_fingerprint(state: &RaftState) -> (u64, Option<String>, Option<String>, u64, u64) {
    let last = state.last_log_index();
    (
        state.current_term,
        state.voted_for.clone(),
        state.leader_id.clone(),
        last,
        state.term_at(last),
    )
}
