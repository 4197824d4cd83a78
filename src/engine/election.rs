//! Leader election: randomized timeouts, vote granting, and the
//! follower -> candidate -> leader transition.

use super::{Effect, RaftEngine};
use crate::log::{EntryKind, LogEntry};
use crate::storage::HardState;
use crate::transport::{Message, RequestVoteRequest, RequestVoteResponse};
use crate::types::{NodeId, Role, Term};
use std::time::Instant;

impl RaftEngine {
    /// `last_log_index`/`last_log_term` are part of the safety check every
    /// voter applies: a candidate's log must be at least as up to date as
    /// the voter's before it earns a vote.
    fn log_is_up_to_date(&self, candidate_last_index: u64, candidate_last_term: Term) -> bool {
        let our_last_term = self.log.term_at(self.log.last_index()).unwrap_or(0);
        let our_last_index = self.log.last_index();
        candidate_last_term > our_last_term
            || (candidate_last_term == our_last_term && candidate_last_index >= our_last_index)
    }

    pub(super) fn start_election(&mut self, now: Instant) -> Vec<Effect> {
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.node_id);
        self.leader_id = None;
        self.reset_election_deadline(now);

        tracing::info!(node_id = self.node_id, term = self.current_term, "starting election");

        let mut effects = vec![Effect::PersistHardState(self.hard_state())];
        let request = RequestVoteRequest {
            term: self.current_term,
            candidate_id: self.node_id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.term_at(self.log.last_index()).unwrap_or(0),
        };
        for peer in self.peers() {
            effects.push(Effect::Send {
                to: peer,
                message: Message::RequestVote(request.clone()),
            });
        }
        // A single-node cluster wins its own election immediately.
        if self.peers().is_empty() {
            effects.extend(self.become_leader(now));
        }
        effects
    }

    pub(super) fn handle_request_vote(
        &mut self,
        from: NodeId,
        req: RequestVoteRequest,
        now: Instant,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();
        if req.term > self.current_term {
            self.step_down(req.term, now);
            effects.push(Effect::PersistHardState(self.hard_state()));
        }

        let grant = req.term == self.current_term
            && (self.voted_for.is_none() || self.voted_for == Some(req.candidate_id))
            && self.log_is_up_to_date(req.last_log_index, req.last_log_term);

        if grant {
            self.voted_for = Some(req.candidate_id);
            self.reset_election_deadline(now);
            effects.push(Effect::PersistHardState(self.hard_state()));
        }

        tracing::debug!(
            node_id = self.node_id,
            candidate = req.candidate_id,
            term = req.term,
            grant,
            "handled vote request"
        );

        effects.push(Effect::Send {
            to: from,
            message: Message::RequestVoteResponse(RequestVoteResponse {
                term: self.current_term,
                voter_id: self.node_id,
                vote_granted: grant,
            }),
        });
        effects
    }

    pub(super) fn handle_request_vote_response(
        &mut self,
        from: NodeId,
        resp: RequestVoteResponse,
        now: Instant,
    ) -> Vec<Effect> {
        if self.maybe_step_down(resp.term, now) {
            return vec![Effect::PersistHardState(self.hard_state())];
        }
        if self.role != Role::Candidate || resp.term != self.current_term || !resp.vote_granted {
            return Vec::new();
        }

        self.match_index.insert(from, 0);
        // `match_index` doubles here as the provisional "granted a vote"
        // set during candidacy; it is reset to real values in
        // `become_leader` before being used for commit-index math.
        let votes = 1 + self
            .peers()
            .iter()
            .filter(|p| self.match_index.contains_key(p))
            .count();

        if votes >= self.configuration.quorum_size() {
            self.become_leader(now)
        } else {
            Vec::new()
        }
    }

    pub(super) fn become_leader(&mut self, now: Instant) -> Vec<Effect> {
        self.role = Role::Leader;
        self.leader_id = Some(self.node_id);
        self.next_index.clear();
        self.match_index.clear();
        self.last_contact.clear();
        let next = self.log.last_index() + 1;
        for peer in self.peers() {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
            // Optimistic: a fresh leader gets a full election timeout of
            // grace before check-quorum can force it to step back down.
            self.last_contact.insert(peer, now);
        }

        tracing::info!(node_id = self.node_id, term = self.current_term, "became leader");

        // A NoOp entry lets the leader commit entries from previous terms
        // by extension, per the Raft paper's commit rule.
        let entry = LogEntry {
            index: self.log.last_index() + 1,
            term: self.current_term,
            kind: EntryKind::NoOp,
            data: Vec::new(),
        };
        self.log.append(entry.clone());
        self.last_heartbeat_sent = now;

        let mut effects = vec![Effect::AppendLog(vec![entry])];
        effects.extend(self.broadcast_append_entries(None));
        effects
    }
}
