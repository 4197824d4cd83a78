//! Single-server configuration changes: no joint consensus, one change
//! outstanding at a time, effective only once the entry is applied (not
//! merely appended or even committed-but-unapplied).

use super::{Effect, RaftEngine};
use crate::error::{RaftError, Result};
use crate::log::{ConfChangeOp, EntryKind, LogEntry};
use crate::types::{LogIndex, NodeId, Role};

#[cfg(test)]
fn test_endpoint(node: NodeId) -> crate::types::Endpoint {
    crate::types::Endpoint {
        host: "127.0.0.1".to_string(),
        port: 7000 + node as u16,
    }
}

#[derive(Debug, Clone)]
pub struct ConfChangeState {
    pub proposed_index: LogIndex,
    pub op: ConfChangeOp,
}

impl RaftEngine {
    pub fn propose_conf_change(&mut self, op: ConfChangeOp) -> Result<(LogIndex, Vec<Effect>)> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                leader_hint: self.leader_id,
            });
        }
        if self.pending_conf_change.is_some() {
            return Err(RaftError::PendingConfChange);
        }
        match &op {
            ConfChangeOp::AddNode(id, _) if self.configuration.contains(*id) => {
                return Err(RaftError::DuplicateNode(*id));
            }
            ConfChangeOp::RemoveNode(id) if !self.configuration.contains(*id) => {
                return Err(RaftError::UnknownNode(*id));
            }
            _ => {}
        }

        let entry = LogEntry {
            index: self.log.last_index() + 1,
            term: self.current_term,
            kind: EntryKind::ConfChange(op.clone()),
            data: Vec::new(),
        };
        let index = entry.index;
        self.log.append(entry.clone());
        self.pending_conf_change = Some(ConfChangeState {
            proposed_index: index,
            op,
        });

        let mut effects = vec![Effect::AppendLog(vec![entry])];
        effects.extend(self.broadcast_append_entries(None));
        Ok((index, effects))
    }

    /// Applies any `ConfChange` entries among newly-applied entries,
    /// mutating the live membership and clearing `pending_conf_change`.
    /// A leader that removes itself steps down immediately, matching
    /// Raft's "a leader must step down once it's no longer in the
    /// configuration" rule.
    pub(super) fn apply_conf_changes(&mut self, entries: &[LogEntry]) {
        for entry in entries {
            if let EntryKind::ConfChange(op) = &entry.kind {
                match op {
                    ConfChangeOp::AddNode(id, endpoint) => {
                        self.configuration.members.insert(*id);
                        self.configuration.set_endpoint(*id, endpoint.clone());
                    }
                    ConfChangeOp::RemoveNode(id) => {
                        self.configuration.members.remove(id);
                        self.configuration.endpoints.remove(id);
                    }
                }
                if self
                    .pending_conf_change
                    .as_ref()
                    .is_some_and(|p| p.proposed_index == entry.index)
                {
                    self.pending_conf_change = None;
                }
                if !self.configuration.contains(self.node_id) && self.role == Role::Leader {
                    tracing::info!(node_id = self.node_id, "removed from configuration, stepping down");
                    self.role = Role::Follower;
                    self.leader_id = None;
                }
            }
        }
    }
}
