//! Leader-side log replication and follower-side AppendEntries handling,
//! including the conflict_index/conflict_term fast-rollback hint and the
//! current-term-only commit index advancement rule.

use super::{Effect, RaftEngine};
use crate::log::LogEntry;
use crate::transport::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse, Message,
};
use crate::types::{LogIndex, NodeId, Role, Term};
use std::time::Instant;

impl RaftEngine {
    /// Sends AppendEntries (or, when a follower has fallen behind the
    /// retained log, InstallSnapshot) to every peer. `read_index_probe`
    /// is attached to every heartbeat so the read-index quorum check rides
    /// piggyback on ordinary replication traffic.
    pub(super) fn broadcast_append_entries(&mut self, read_index_probe: Option<u64>) -> Vec<Effect> {
        let mut effects = Vec::new();
        for peer in self.peers() {
            effects.push(self.send_append_entries_to(peer, read_index_probe));
        }
        effects
    }

    fn send_append_entries_to(&mut self, peer: NodeId, read_index_probe: Option<u64>) -> Effect {
        let next = *self.next_index.get(&peer).unwrap_or(&(self.log.last_index() + 1));

        if next <= self.log.first_index() && self.log.first_index() > 1 {
            // The follower needs entries we've already compacted away.
            return self.send_install_snapshot_to(peer);
        }

        let prev_log_index = next.saturating_sub(1);
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        let entries = self
            .log
            .get_range(next, self.log.last_index())
            .into_iter()
            .take(self.max_entries_per_append)
            .collect::<Vec<LogEntry>>();

        Effect::Send {
            to: peer,
            message: Message::AppendEntries(AppendEntriesRequest {
                term: self.current_term,
                leader_id: self.node_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
                read_index_probe,
            }),
        }
    }

    fn send_install_snapshot_to(&self, peer: NodeId) -> Effect {
        // The engine holds no durable snapshot bytes itself; the worker
        // fills this in from storage before sending. Here we emit the
        // request shape with the metadata the engine does know, leaving
        // `state_blob` for the worker to attach.
        Effect::Send {
            to: peer,
            message: Message::InstallSnapshot(InstallSnapshotRequest {
                term: self.current_term,
                leader_id: self.node_id,
                included_index: self.log.first_index().saturating_sub(1),
                included_term: self.log.term_at(self.log.first_index().saturating_sub(1)).unwrap_or(0),
                configuration: self.configuration.clone(),
                state_blob: Vec::new(),
            }),
        }
    }

    pub(super) fn handle_append_entries(
        &mut self,
        from: NodeId,
        req: AppendEntriesRequest,
        now: Instant,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        if req.term < self.current_term {
            effects.push(Effect::Send {
                to: from,
                message: Message::AppendEntriesResponse(AppendEntriesResponse {
                    term: self.current_term,
                    follower_id: self.node_id,
                    success: false,
                    conflict_index: 0,
                    conflict_term: 0,
                    read_index_probe: req.read_index_probe,
                }),
            });
            return effects;
        }

        if req.term > self.current_term || self.role != Role::Follower {
            self.step_down(req.term, now);
            effects.push(Effect::PersistHardState(self.hard_state()));
        }
        self.leader_id = Some(req.leader_id);
        self.reset_election_deadline(now);

        match self.log.term_at(req.prev_log_index) {
            Some(term) if term == req.prev_log_term => {
                // `RaftLog::append_entries` truncates its in-memory suffix on
                // a term conflict, but storage only ever gets told about the
                // append — tell it about the truncation too, or a crash
                // leaves the stale suffix on disk forever.
                let conflict_index = req.entries.iter().find_map(|e| {
                    match self.log.term_at(e.index) {
                        Some(existing_term) if e.index <= self.log.last_index() && existing_term != e.term => {
                            Some(e.index)
                        }
                        _ => None,
                    }
                });
                if let Some(index) = conflict_index {
                    effects.push(Effect::TruncateLog(index));
                }
                self.log.append_entries(&req.entries);
                if !req.entries.is_empty() {
                    effects.push(Effect::AppendLog(req.entries.clone()));
                }
                if req.leader_commit > self.commit_index {
                    self.commit_index = req.leader_commit.min(self.log.last_index());
                    effects.push(Effect::PersistHardState(self.hard_state()));
                }
                effects.push(Effect::Send {
                    to: from,
                    message: Message::AppendEntriesResponse(AppendEntriesResponse {
                        term: self.current_term,
                        follower_id: self.node_id,
                        success: true,
                        conflict_index: 0,
                        conflict_term: 0,
                        read_index_probe: req.read_index_probe,
                    }),
                });
            }
            _ => {
                let (conflict_index, conflict_term) = self.find_conflict_hint(req.prev_log_index);
                effects.push(Effect::Send {
                    to: from,
                    message: Message::AppendEntriesResponse(AppendEntriesResponse {
                        term: self.current_term,
                        follower_id: self.node_id,
                        success: false,
                        conflict_index,
                        conflict_term,
                        read_index_probe: req.read_index_probe,
                    }),
                });
            }
        }
        effects
    }

    /// Computes the fast-rollback hint: the first index of the conflicting
    /// term, so the leader can skip straight past an entire mismatched
    /// term on its next attempt instead of retreating one entry at a time.
    fn find_conflict_hint(&self, prev_log_index: LogIndex) -> (LogIndex, Term) {
        if prev_log_index > self.log.last_index() {
            return (self.log.last_index() + 1, 0);
        }
        let conflict_term = self.log.term_at(prev_log_index).unwrap_or(0);
        let mut index = prev_log_index;
        while index > self.log.first_index() && self.log.term_at(index - 1) == Some(conflict_term) {
            index -= 1;
        }
        (index, conflict_term)
    }

    pub(super) fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        resp: AppendEntriesResponse,
        now: Instant,
    ) -> Vec<Effect> {
        if self.maybe_step_down(resp.term, now) {
            return vec![Effect::PersistHardState(self.hard_state())];
        }
        if !self.is_leader() || resp.term != self.current_term {
            return Vec::new();
        }
        self.last_contact.insert(from, now);

        let mut effects = Vec::new();
        if resp.success {
            let next = *self.next_index.get(&from).unwrap_or(&1);
            let match_idx = next.saturating_sub(1).max(self.match_index.get(&from).copied().unwrap_or(0));
            self.match_index.insert(from, match_idx);
            self.next_index.insert(from, match_idx + 1);
            effects.extend(self.advance_commit_index());
        } else if resp.conflict_index > 0 {
            self.next_index.insert(from, resp.conflict_index.max(1));
            effects.push(self.send_append_entries_to(from, None));
        } else {
            let next = self.next_index.entry(from).or_insert(self.log.last_index() + 1);
            *next = next.saturating_sub(1).max(1);
        }

        if let Some(token) = resp.read_index_probe {
            effects.extend(self.record_read_index_ack(from, token));
        }
        effects
    }

    /// Recomputes `commit_index` as the highest index replicated to a
    /// majority, restricted to entries from the current term — replicating
    /// an older-term entry to a majority is not sufficient to commit it
    /// (Raft figure 8).
    pub(super) fn advance_commit_index(&mut self) -> Vec<Effect> {
        let quorum = self.configuration.quorum_size();
        let mut candidate = self.commit_index;
        let mut idx = self.commit_index + 1;
        while idx <= self.log.last_index() {
            let count = 1 + self
                .peers()
                .iter()
                .filter(|p| self.match_index.get(p).copied().unwrap_or(0) >= idx)
                .count();
            if count >= quorum && self.log.term_at(idx) == Some(self.current_term) {
                candidate = idx;
            }
            idx += 1;
        }
        if candidate > self.commit_index {
            self.commit_index = candidate;
            vec![Effect::PersistHardState(self.hard_state())]
        } else {
            Vec::new()
        }
    }

    pub(super) fn handle_install_snapshot(
        &mut self,
        from: NodeId,
        req: InstallSnapshotRequest,
        now: Instant,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        if req.term < self.current_term {
            return effects;
        }
        if req.term > self.current_term {
            self.step_down(req.term, now);
            effects.push(Effect::PersistHardState(self.hard_state()));
        }
        self.leader_id = Some(req.leader_id);
        self.reset_election_deadline(now);

        let configuration = req.configuration.clone();
        let included_index = req.included_index;
        let snapshot = req.into_snapshot();

        self.configuration = configuration;
        self.log = crate::log::RaftLog::new(included_index + 1);
        self.commit_index = self.commit_index.max(included_index);
        self.last_applied = self.last_applied.max(included_index);

        effects.push(Effect::PersistSnapshot(snapshot));
        effects.push(Effect::Send {
            to: from,
            message: Message::InstallSnapshotResponse(InstallSnapshotResponse {
                term: self.current_term,
                follower_id: self.node_id,
                included_index,
            }),
        });
        effects
    }

    pub(super) fn handle_install_snapshot_response(
        &mut self,
        from: NodeId,
        resp: InstallSnapshotResponse,
        now: Instant,
    ) -> Vec<Effect> {
        if !self.is_leader() || resp.term != self.current_term {
            return Vec::new();
        }
        self.last_contact.insert(from, now);
        self.match_index.insert(from, resp.included_index);
        self.next_index.insert(from, resp.included_index + 1);
        self.advance_commit_index()
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests_support::*;
    use super::*;
    use crate::log::EntryKind;

    fn entry(index: LogIndex, term: Term) -> LogEntry {
        LogEntry {
            index,
            term,
            kind: EntryKind::Normal,
            data: vec![],
        }
    }

    #[test]
    fn follower_accepts_matching_prev_log() {
        let mut engine = test_engine(2, &[1, 2, 3]);
        let effects = engine.handle_append_entries(
            1,
            AppendEntriesRequest {
                term: 1,
                leader_id: 1,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![entry(1, 1)],
                leader_commit: 1,
                read_index_probe: None,
            },
            Instant::now(),
        );
        assert_eq!(engine.log.last_index(), 1);
        assert_eq!(engine.commit_index, 1);
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Send {
                message: Message::AppendEntriesResponse(r),
                ..
            } if r.success
        )));
    }

    #[test]
    fn follower_rejects_on_log_mismatch_with_conflict_hint() {
        let mut engine = test_engine(2, &[1, 2, 3]);
        let effects = engine.handle_append_entries(
            1,
            AppendEntriesRequest {
                term: 1,
                leader_id: 1,
                prev_log_index: 5,
                prev_log_term: 1,
                entries: vec![],
                leader_commit: 0,
                read_index_probe: None,
            },
            Instant::now(),
        );
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Send {
                message: Message::AppendEntriesResponse(r),
                ..
            } if !r.success && r.conflict_index == 1
        )));
    }

    #[test]
    fn commit_index_requires_current_term_entry() {
        let mut engine = test_engine(1, &[1, 2, 3]);
        engine.role = Role::Leader;
        engine.current_term = 2;
        engine.log.append(entry(1, 1)); // stale-term entry
        engine.match_index.insert(2, 1);
        engine.match_index.insert(3, 1);
        let effects = engine.advance_commit_index();
        assert!(effects.is_empty());
        assert_eq!(engine.commit_index, 0);
    }

    #[test]
    fn commit_index_advances_on_majority_current_term() {
        let mut engine = test_engine(1, &[1, 2, 3]);
        engine.role = Role::Leader;
        engine.current_term = 1;
        engine.log.append(entry(1, 1));
        engine.match_index.insert(2, 1);
        engine.match_index.insert(3, 0);
        let effects = engine.advance_commit_index();
        assert_eq!(engine.commit_index, 1);
        assert!(effects.iter().any(|e| matches!(e, Effect::PersistHardState(_))));
    }

    #[test]
    fn stale_term_append_entries_rejected() {
        let mut engine = test_engine(2, &[1, 2, 3]);
        engine.current_term = 5;
        let effects = engine.handle_append_entries(
            1,
            AppendEntriesRequest {
                term: 3,
                leader_id: 1,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: vec![],
                leader_commit: 0,
                read_index_probe: None,
            },
            Instant::now(),
        );
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Send {
                message: Message::AppendEntriesResponse(r),
                ..
            } if !r.success && r.term == 5
        )));
    }

    #[test]
    fn conflicting_entries_emit_truncate_before_append() {
        let mut engine = test_engine(2, &[1, 2, 3]);
        engine.log.append(entry(1, 1));
        engine.log.append(entry(2, 1));
        engine.log.append(entry(3, 1));

        let effects = engine.handle_append_entries(
            1,
            AppendEntriesRequest {
                term: 2,
                leader_id: 1,
                prev_log_index: 1,
                prev_log_term: 1,
                entries: vec![entry(2, 2), entry(3, 2)],
                leader_commit: 0,
                read_index_probe: None,
            },
            Instant::now(),
        );
        let truncate_pos = effects
            .iter()
            .position(|e| matches!(e, Effect::TruncateLog(2)))
            .expect("conflict at index 2 must emit a truncate effect");
        let append_pos = effects
            .iter()
            .position(|e| matches!(e, Effect::AppendLog(_)))
            .expect("conflicting entries still get appended once truncated");
        assert!(truncate_pos < append_pos, "truncate must precede append");
        assert_eq!(engine.log.term_at(2), Some(2));
        assert_eq!(engine.log.term_at(3), Some(2));
    }
}
