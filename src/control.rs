//! The SQL-reachable control surface: the in-process function calls a
//! hosting database server would register against its function catalog.

use crate::error::{RaftError, Result};
use crate::log::ConfChangeOp;
use crate::state_machine::Command;
use crate::types::{Endpoint, LogIndex, NodeId, Role, Term, WorkerState};
use crate::worker::WorkerHandle;

#[derive(Debug, Clone)]
pub struct ClusterStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub current_term: Term,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub leader_id: Option<NodeId>,
}

/// One row of `get_nodes()`: a member's id, where it lives, and whether it
/// is the leader this caller currently observes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRow {
    pub id: NodeId,
    pub host: String,
    pub port: u16,
    pub is_leader: bool,
}

/// A `Send + Sync` handle, cloned into every SQL session, that fronts the
/// worker. `init()` is idempotent: calling it again once the worker is
/// already running is a no-op, not an error.
#[derive(Clone)]
pub struct RaftControl {
    handle: WorkerHandle,
}

impl RaftControl {
    pub fn new(handle: WorkerHandle) -> Self {
        Self { handle }
    }

    /// No-op: by the time a `RaftControl` exists, the worker it wraps has
    /// already been started from configuration. Present so callers that
    /// expect an explicit init step (mirroring the host's own startup
    /// sequencing) can call it unconditionally.
    pub fn init(&self) -> Result<()> {
        Ok(())
    }

    pub fn is_leader(&self) -> bool {
        self.handle.published().role == Role::Leader
    }

    pub fn get_term(&self) -> Term {
        self.handle.published().current_term
    }

    pub fn get_leader(&self) -> Option<NodeId> {
        self.handle.published().leader_id
    }

    pub fn get_cluster_status(&self) -> ClusterStatus {
        let state = self.handle.published();
        ClusterStatus {
            node_id: state.node_id,
            role: state.role,
            current_term: state.current_term,
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            leader_id: state.leader_id,
        }
    }

    pub fn get_nodes(&self) -> Vec<NodeRow> {
        let state = self.handle.published();
        state
            .configuration
            .members
            .iter()
            .map(|&id| {
                let endpoint = state.configuration.endpoint(id);
                NodeRow {
                    id,
                    host: endpoint.map(|e| e.host.clone()).unwrap_or_default(),
                    port: endpoint.map(|e| e.port).unwrap_or(0),
                    is_leader: state.leader_id == Some(id),
                }
            })
            .collect()
    }

    pub async fn add_node(&self, node_id: NodeId, host: String, port: u16) -> Result<LogIndex> {
        self.handle
            .propose_conf_change(ConfChangeOp::AddNode(node_id, Endpoint { host, port }))
            .await
    }

    pub async fn remove_node(&self, node_id: NodeId) -> Result<LogIndex> {
        self.handle.propose_conf_change(ConfChangeOp::RemoveNode(node_id)).await
    }

    /// Replicates arbitrary caller bytes. Unlike `kv_put`/`kv_delete`, these
    /// are not required to decode as a `Command`; a payload that doesn't
    /// is skipped (not panicked on) once applied, see `KvStateMachine::apply_entries`.
    pub async fn replicate_entry(&self, data: Vec<u8>) -> Result<LogIndex> {
        self.handle.propose(data).await
    }

    pub async fn kv_put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<LogIndex> {
        let command = Command::Put { key, value };
        self.handle
            .propose(crate::state_machine::encode_command(&command))
            .await
    }

    pub async fn kv_delete(&self, key: Vec<u8>) -> Result<LogIndex> {
        let command = Command::Delete { key };
        self.handle
            .propose(crate::state_machine::encode_command(&command))
            .await
    }

    /// Linearizable read: confirms leadership via a read-index quorum round
    /// before returning the value, so a partitioned ex-leader can't serve a
    /// stale read to a caller.
    pub async fn kv_get(&self, key: Vec<u8>) -> Result<Option<Vec<u8>>> {
        if !self.is_leader() {
            return Err(RaftError::NotLeader {
                leader_hint: self.get_leader(),
            });
        }
        self.handle.read_index().await?;
        self.handle.kv_get(key).await
    }

    pub async fn set_debug(&self, enabled: bool) -> Result<()> {
        self.handle.set_debug(enabled).await
    }

    pub fn get_worker_state(&self) -> WorkerState {
        self.handle.published().worker_state
    }
}
