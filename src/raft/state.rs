use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::storage::PersistedState;

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

/// A single entry in the replicated log.
///
/// Entries are immutable once created; a follower removes them only by
/// truncating a conflicting suffix. Positions are 1-based and derived from
/// the entry's slot in the log, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub command: String,
}

/// Consensus state of a single node.
///
/// One instance exists per process, owned by the node's `RwLock`; every
/// multi-field transition runs under one write guard so concurrent timer
/// callbacks and RPC completions can never observe a half-applied update.
///
/// # Safety invariants
///
/// - `current_term` never decreases, and `voted_for` is cleared exactly
///   when it strictly increases.
/// - At most one vote is granted per term; the vote is recorded before the
///   grant leaves the handler.
/// - `commit_index <= log.len()` and never decreases.
/// - The leader advances `commit_index` to N only when a majority of the
///   cluster (itself included) has `match_index >= N` and the entry at N
///   carries the leader's current term.
#[derive(Debug)]
pub struct RaftState {
    pub node_id: String,

    // Persistent state
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub log: Vec<LogEntry>,

    // Volatile state on all servers
    pub commit_index: u64,
    pub last_applied: u64,

    // Volatile state on leaders (reinitialized after election)
    pub next_index: HashMap<String, u64>,
    pub match_index: HashMap<String, u64>,

    pub role: RaftRole,

    // Known leader (if any)
    pub leader_id: Option<String>,

    // Votes received in the current election (for candidates)
    pub votes_received: u64,

    // Commands handed to the state machine, in apply order
    pub applied: Vec<String>,
}

impl RaftState {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            commit_index: 0,
            last_applied: 0,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            role: RaftRole::Follower,
            leader_id: None,
            votes_received: 0,
            applied: Vec::new(),
        }
    }

    /// Rebuild the in-memory state from a persisted snapshot. Commit and
    /// apply cursors are volatile and restart at zero.
    pub fn restore(node_id: impl Into<String>, persisted: PersistedState) -> Self {
        let mut state = Self::new(node_id);
        state.current_term = persisted.current_term;
        state.voted_for = persisted.voted_for;
        state.leader_id = persisted.leader_id;
        state.log = persisted.entries;
        state
    }

    /// Snapshot of the durable fields, as written to the state file.
    pub fn to_persisted(&self) -> PersistedState {
        PersistedState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            leader_id: self.leader_id.clone(),
            entries: self.log.clone(),
        }
    }

    /// Index of the last log entry (0 when the log is empty).
    pub fn last_log_index(&self) -> u64 {
        self.log.len() as u64
    }

    /// Term stored at `index`, or 0 outside `[1, len]`.
    pub fn term_at(&self, index: u64) -> u64 {
        if index == 0 || index > self.log.len() as u64 {
            return 0;
        }
        self.log[(index - 1) as usize].term
    }

    /// Commands in `[start_index, end_index]`, bounds clamped to the log.
    pub fn commands_from_to(&self, start_index: u64, end_index: u64) -> Vec<String> {
        let start = start_index.max(1);
        let end = end_index.min(self.log.len() as u64);
        if start > end {
            return Vec::new();
        }
        self.log[(start - 1) as usize..end as usize]
            .iter()
            .map(|e| e.command.clone())
            .collect()
    }

    /// Follower-side AppendEntries with the log-matching consistency check.
    ///
    /// Rejects without touching the log when the entry at `prev_log_index`
    /// does not carry `prev_log_term`. Otherwise truncates any conflicting
    /// suffix, appends the new commands at `term`, and advances the commit
    /// cursor to `min(leader_commit, log length)`.
    pub fn append_with_consistency(
        &mut self,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: &[String],
        term: u64,
        leader_commit: u64,
    ) -> bool {
        if prev_log_index > 0 && self.term_at(prev_log_index) != prev_log_term {
            return false;
        }

        self.append_entries(prev_log_index, entries, term);
        self.set_commit_index(leader_commit);
        true
    }

    /// Low-level truncate-then-append: drop everything after
    /// `prev_log_index`, then append `entries` stamped with `term`. Used by
    /// followers and by a leader appending its own new command.
    pub fn append_entries(&mut self, prev_log_index: u64, entries: &[String], term: u64) {
        if self.log.len() as u64 > prev_log_index {
            self.log.truncate(prev_log_index as usize);
        }
        for command in entries {
            self.log.push(LogEntry {
                term,
                command: command.clone(),
            });
        }
    }

    /// Advance the commit cursor, clamped to the log length, and apply the
    /// newly committed entries in order. Moving backwards is a no-op.
    pub fn set_commit_index(&mut self, new_commit_index: u64) {
        if new_commit_index > self.commit_index {
            self.commit_index = new_commit_index.min(self.log.len() as u64);
            self.apply_committed();
        }
    }

    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            let entry = &self.log[(self.last_applied - 1) as usize];
            tracing::info!(
                node_id = %self.node_id,
                index = self.last_applied,
                command = %entry.command,
                "Applying entry"
            );
            self.applied.push(entry.command.clone());
        }
    }

    /// Transition to follower. Adopting a strictly higher term clears the
    /// vote; re-entering follower at the same term keeps it, so a node can
    /// never vote twice in one term.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        self.role = RaftRole::Follower;
        self.votes_received = 0;
    }

    /// Open a new election round: bump the term, vote for self.
    pub fn become_candidate(&mut self) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.node_id.clone());
        self.votes_received = 1; // Self-vote
        self.leader_id = None;
    }

    /// Take leadership: record self as leader and reset replication
    /// progress for every peer. Called exactly once per accession.
    pub fn become_leader(&mut self, peer_ids: &[String]) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.node_id.clone());
        self.init_leader_state(peer_ids);
    }

    fn init_leader_state(&mut self, peer_ids: &[String]) {
        let next = self.last_log_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for peer_id in peer_ids {
            self.next_index.insert(peer_id.clone(), next);
            self.match_index.insert(peer_id.clone(), 0);
        }
    }

    pub fn next_index_for(&self, peer_id: &str) -> u64 {
        self.next_index
            .get(peer_id)
            .copied()
            .unwrap_or(self.last_log_index() + 1)
    }

    pub fn match_index_for(&self, peer_id: &str) -> u64 {
        self.match_index.get(peer_id).copied().unwrap_or(0)
    }

    /// Back off one step after a follower rejected an AppendEntries.
    pub fn decrement_next_index(&mut self, peer_id: &str) {
        let current = self.next_index_for(peer_id);
        if current > 1 {
            self.next_index.insert(peer_id.to_string(), current - 1);
        }
    }

    /// Record a follower's acknowledged position and try to advance the
    /// commit cursor.
    pub fn update_follower_progress(&mut self, peer_id: &str, match_idx: u64) {
        self.match_index.insert(peer_id.to_string(), match_idx);
        self.next_index.insert(peer_id.to_string(), match_idx + 1);
        self.advance_leader_commit();
    }

    /// Scan upward from the commit cursor. An index commits once a majority
    /// of the cluster (this node included) has it, and the entry at that
    /// index was written in the current term. Entries from older terms are
    /// skipped; they commit implicitly when a current-term entry above them
    /// does.
    fn advance_leader_commit(&mut self) {
        let majority = (self.match_index.len() as u64 + 1) / 2 + 1;
        for index in self.commit_index + 1..=self.last_log_index() {
            let count = 1 + self
                .match_index
                .values()
                .filter(|&&matched| matched >= index)
                .count() as u64;
            if count >= majority && self.term_at(index) == self.current_term {
                tracing::debug!(node_id = %self.node_id, commit_index = index, "Advancing commit index");
                self.set_commit_index(index);
            }
        }
    }
}
