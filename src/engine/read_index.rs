//! Linearizable reads via the read-index protocol: before servicing a read,
//! the leader confirms it is still the leader by collecting acks from a
//! majority for a heartbeat round tagged with a probe token, then the read
//! is safe to service at the commit index recorded when the round started.

use super::{Effect, RaftEngine};
use crate::error::{RaftError, Result};
use crate::types::{LogIndex, NodeId};
use std::collections::HashSet;

#[derive(Debug)]
pub struct PendingRead {
    pub token: u64,
    pub at_index: LogIndex,
    acked: HashSet<NodeId>,
}

impl RaftEngine {
    /// Starts a read-index round. Returns the token the caller should match
    /// against the eventual `Effect::ReadReady`.
    pub fn request_read_index(&mut self) -> Result<(u64, Vec<Effect>)> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                leader_hint: self.leader_id,
            });
        }
        let token = self.next_read_index_token();
        let at_index = self.commit_index;

        if self.peers().is_empty() {
            return Ok((token, vec![Effect::ReadReady { token, at_index }]));
        }

        self.pending_reads.push(PendingRead {
            token,
            at_index,
            acked: HashSet::new(),
        });
        let effects = self.broadcast_append_entries(Some(token));
        Ok((token, effects))
    }

    fn next_read_index_token(&mut self) -> u64 {
        self.last_applied.wrapping_add(self.pending_reads.len() as u64).wrapping_add(1)
            ^ (self.current_term << 32)
    }

    pub(super) fn record_read_index_ack(&mut self, from: NodeId, token: u64) -> Vec<Effect> {
        let quorum = self.configuration.quorum_size();
        let mut ready = None;
        if let Some(pending) = self.pending_reads.iter_mut().find(|p| p.token == token) {
            pending.acked.insert(from);
            // +1 for the leader's own implicit ack.
            if pending.acked.len() + 1 >= quorum {
                ready = Some((pending.token, pending.at_index));
            }
        }
        if let Some((token, at_index)) = ready {
            self.pending_reads.retain(|p| p.token != token);
            vec![Effect::ReadReady { token, at_index }]
        } else {
            Vec::new()
        }
    }
}
