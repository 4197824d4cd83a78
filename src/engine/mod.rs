//! The consensus engine: a pure state machine. Nothing in this module
//! touches disk or the network directly — every tick and every incoming
//! message produces a list of `Effect`s that the worker is responsible for
//! carrying out in the right order (persist, then send, then apply).

pub mod confchange;
pub mod election;
pub mod read_index;
pub mod replication;

use crate::log::{EntryKind, LogEntry};
use crate::storage::{ClusterConfiguration, HardState, Snapshot};
use crate::transport::Message;
use crate::types::{LogIndex, NodeId, Role, Term};
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub use confchange::ConfChangeState;
pub use read_index::PendingRead;

/// Something the worker must do as a result of a tick or an incoming
/// message. Order within the returned `Vec` matters: persistence effects
/// always precede `Send`/`Apply` effects for the same call.
#[derive(Debug, Clone)]
pub enum Effect {
    PersistHardState(HardState),
    AppendLog(Vec<LogEntry>),
    TruncateLog(LogIndex),
    PersistSnapshot(Snapshot),
    CompactLog(LogIndex),
    Send { to: NodeId, message: Message },
    Apply { entries: Vec<LogEntry> },
    ReadReady { token: u64, at_index: LogIndex },
}

pub struct RaftEngine {
    pub node_id: NodeId,
    pub role: Role,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: crate::log::RaftLog,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub configuration: ClusterConfiguration,
    pub leader_id: Option<NodeId>,

    pub election_timeout_range: (Duration, Duration),
    pub heartbeat_interval: Duration,
    pub election_deadline: Instant,
    pub last_heartbeat_sent: Instant,

    pub snapshot_threshold: u64,
    pub max_entries_per_append: usize,

    // Leader-only bookkeeping, reset on every election.
    pub next_index: HashMap<NodeId, LogIndex>,
    pub match_index: HashMap<NodeId, LogIndex>,
    /// Last time an `AppendEntriesResponse`/`InstallSnapshotResponse` was
    /// received from each peer, used by the leader's check-quorum: a leader
    /// that can't reach a majority within one election timeout steps down.
    pub last_contact: HashMap<NodeId, Instant>,

    pub pending_conf_change: Option<ConfChangeState>,
    pub pending_reads: Vec<PendingRead>,
}

impl RaftEngine {
    pub fn new(
        node_id: NodeId,
        configuration: ClusterConfiguration,
        election_timeout_range: (Duration, Duration),
        heartbeat_interval: Duration,
        snapshot_threshold: u64,
        max_entries_per_append: usize,
        hard_state: HardState,
        log: crate::log::RaftLog,
        last_applied: LogIndex,
        now: Instant,
    ) -> Self {
        let mut engine = Self {
            node_id,
            role: Role::Follower,
            current_term: hard_state.term,
            voted_for: hard_state.voted_for,
            log,
            commit_index: hard_state.commit_index,
            last_applied,
            configuration,
            leader_id: None,
            election_timeout_range,
            heartbeat_interval,
            election_deadline: now,
            last_heartbeat_sent: now,
            snapshot_threshold,
            max_entries_per_append,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            last_contact: HashMap::new(),
            pending_conf_change: None,
            pending_reads: Vec::new(),
        };
        engine.reset_election_deadline(now);
        engine
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.configuration
            .members
            .iter()
            .copied()
            .filter(|&id| id != self.node_id)
            .collect()
    }

    /// True once a leader has gone a full election timeout without hearing
    /// back from a quorum of its peers — the check-quorum condition that
    /// forces a step-down even though no higher term has been observed.
    fn quorum_lost(&self, now: Instant) -> bool {
        let peers = self.peers();
        if peers.is_empty() {
            return false;
        }
        let threshold = self.election_timeout_range.0;
        let acked = peers
            .iter()
            .filter(|p| {
                self.last_contact
                    .get(p)
                    .is_some_and(|&last| now.duration_since(last) < threshold)
            })
            .count();
        acked + 1 < self.configuration.quorum_size()
    }

    fn hard_state(&self) -> HardState {
        HardState {
            term: self.current_term,
            voted_for: self.voted_for,
            commit_index: self.commit_index,
        }
    }

    pub(crate) fn reset_election_deadline(&mut self, now: Instant) {
        let (min, max) = self.election_timeout_range;
        let jitter = rand::rng().random_range(min..max);
        self.election_deadline = now + jitter;
    }

    /// Unconditionally drops to follower of `term`, clearing leader-only
    /// state. Callers persist the resulting hard state.
    pub(crate) fn step_down(&mut self, term: Term, now: Instant) {
        self.role = Role::Follower;
        self.current_term = term;
        self.voted_for = None;
        self.leader_id = None;
        self.next_index.clear();
        self.match_index.clear();
        self.last_contact.clear();
        self.pending_conf_change = None;
        self.reset_election_deadline(now);
        tracing::info!(node_id = self.node_id, term, "stepped down to follower");
    }

    /// Observes a term carried on an incoming message; steps down if it is
    /// newer than ours. Returns true if a step-down occurred.
    pub(crate) fn maybe_step_down(&mut self, observed_term: Term, now: Instant) -> bool {
        if observed_term > self.current_term {
            self.step_down(observed_term, now);
            true
        } else {
            false
        }
    }

    /// Entries committed but not yet applied, advancing `last_applied`.
    fn take_newly_committed(&mut self) -> Vec<LogEntry> {
        if self.commit_index <= self.last_applied {
            return Vec::new();
        }
        let entries = self.log.get_range(self.last_applied + 1, self.commit_index);
        self.last_applied = self.commit_index;
        entries
    }

    /// Drives one iteration of the tick loop: checks the election timer (as
    /// a follower/candidate) or sends heartbeats (as a leader).
    pub fn tick(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        match self.role {
            Role::Leader => {
                if now >= self.last_heartbeat_sent + self.heartbeat_interval {
                    self.last_heartbeat_sent = now;
                    effects.extend(self.broadcast_append_entries(None));
                }
                if self.quorum_lost(now) {
                    tracing::warn!(
                        node_id = self.node_id,
                        term = self.current_term,
                        "failed to reach a majority of peers within one election timeout, stepping down"
                    );
                    let term = self.current_term;
                    self.step_down(term, now);
                    effects.push(Effect::PersistHardState(self.hard_state()));
                }
            }
            Role::Follower | Role::Candidate => {
                if now >= self.election_deadline {
                    effects.extend(self.start_election(now));
                }
            }
        }
        effects.extend(self.apply_committed_entries());
        effects
    }

    fn apply_committed_entries(&mut self) -> Vec<Effect> {
        let entries = self.take_newly_committed();
        if entries.is_empty() {
            return Vec::new();
        }
        self.apply_conf_changes(&entries);
        let mut effects = vec![Effect::Apply { entries }];
        effects.extend(self.maybe_snapshot());
        effects
    }

    /// Compacts the log and emits a snapshot once more entries have
    /// accumulated since the last one than `snapshot_threshold` allows, so a
    /// long-lived node doesn't retain its whole history forever. The worker
    /// fills in `state_blob` from the state machine before persisting it.
    fn maybe_snapshot(&mut self) -> Vec<Effect> {
        if self.snapshot_threshold == 0 || self.last_applied < self.log.first_index() {
            return Vec::new();
        }
        let retained = self.last_applied + 1 - self.log.first_index();
        if retained < self.snapshot_threshold {
            return Vec::new();
        }
        let included_index = self.last_applied;
        let included_term = self.log.term_at(included_index).unwrap_or(0);
        self.log.compact(included_index);
        tracing::info!(
            node_id = self.node_id,
            included_index,
            "log crossed snapshot threshold, compacting"
        );
        vec![Effect::PersistSnapshot(Snapshot {
            included_index,
            included_term,
            configuration: self.configuration.clone(),
            state_blob: Vec::new(),
        })]
    }

    pub fn handle_message(&mut self, from: NodeId, message: Message, now: Instant) -> Vec<Effect> {
        match message {
            Message::RequestVote(req) => self.handle_request_vote(from, req, now),
            Message::RequestVoteResponse(resp) => self.handle_request_vote_response(from, resp, now),
            Message::AppendEntries(req) => self.handle_append_entries(from, req, now),
            Message::AppendEntriesResponse(resp) => self.handle_append_entries_response(from, resp, now),
            Message::InstallSnapshot(req) => self.handle_install_snapshot(from, req, now),
            Message::InstallSnapshotResponse(resp) => self.handle_install_snapshot_response(from, resp, now),
            Message::Handshake(_) => Vec::new(), // consumed by the transport layer, not the engine
        }
    }

    /// Proposes a client command. Leader-only.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<(LogIndex, Vec<Effect>), crate::error::RaftError> {
        if !self.is_leader() {
            return Err(crate::error::RaftError::NotLeader {
                leader_hint: self.leader_id,
            });
        }
        let entry = LogEntry {
            index: self.log.last_index() + 1,
            term: self.current_term,
            kind: EntryKind::Normal,
            data,
        };
        let index = entry.index;
        self.log.append(entry.clone());
        let mut effects = vec![Effect::AppendLog(vec![entry])];
        effects.extend(self.broadcast_append_entries(None));
        Ok((index, effects))
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::RaftEngine;
    use crate::storage::{ClusterConfiguration, HardState};
    use crate::types::NodeId;
    use std::time::{Duration, Instant};

    pub fn test_engine(node_id: NodeId, members: &[NodeId]) -> RaftEngine {
        RaftEngine::new(
            node_id,
            ClusterConfiguration::new(members.iter().copied()),
            (Duration::from_millis(1000), Duration::from_millis(2000)),
            Duration::from_millis(100),
            10_000,
            100,
            HardState::default(),
            crate::log::RaftLog::new(1),
            0,
            Instant::now(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::test_engine as new_engine;
    use super::*;

    #[test]
    fn starts_as_follower() {
        let engine = new_engine(1, &[1, 2, 3]);
        assert_eq!(engine.role, Role::Follower);
        assert!(!engine.is_leader());
    }

    #[test]
    fn propose_rejected_when_not_leader() {
        let mut engine = new_engine(1, &[1, 2, 3]);
        let result = engine.propose(vec![1]);
        assert!(matches!(result, Err(crate::error::RaftError::NotLeader { .. })));
    }

    #[test]
    fn election_timeout_triggers_candidacy() {
        let mut engine = new_engine(1, &[1, 2, 3]);
        let later = Instant::now() + Duration::from_secs(5);
        let effects = engine.tick(later);
        assert_eq!(engine.role, Role::Candidate);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::PersistHardState(_))));
    }
}
