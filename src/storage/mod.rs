//! Durable persistence contract.
//!
//! The consensus engine never touches a filesystem directly; it calls
//! through this trait, which guarantees that every write it acknowledges
//! has survived an `fsync` before the engine is allowed to act on it.

pub mod disk;

use crate::log::LogEntry;
use crate::types::{Endpoint, LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub commit_index: LogIndex,
}

/// The set of voting members, plus their endpoints. Single-server changes
/// only: no joint consensus, one member added or removed at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    pub members: BTreeSet<NodeId>,
    pub endpoints: BTreeMap<NodeId, Endpoint>,
}

impl ClusterConfiguration {
    pub fn new(members: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            members: members.into_iter().collect(),
            endpoints: BTreeMap::new(),
        }
    }

    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.members.contains(&node)
    }

    pub fn set_endpoint(&mut self, node: NodeId, endpoint: Endpoint) {
        self.endpoints.insert(node, endpoint);
    }

    pub fn endpoint(&self, node: NodeId) -> Option<&Endpoint> {
        self.endpoints.get(&node)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub included_index: LogIndex,
    pub included_term: Term,
    pub configuration: ClusterConfiguration,
    pub state_blob: Vec<u8>,
}

/// Everything durably recorded on disk, returned as a unit at startup so the
/// engine can reconstruct its in-memory state in one pass.
pub struct LoadedState {
    pub hard_state: HardState,
    pub snapshot: Option<Snapshot>,
    pub entries: Vec<LogEntry>,
}

#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Appends entries to the durable log. Entries already on disk at the
    /// given indices (from an earlier, now-superseded call) are overwritten.
    async fn append(&self, entries: &[LogEntry]) -> crate::error::Result<()>;

    /// Removes every entry at or after `index` from the durable log.
    async fn truncate_from(&self, index: LogIndex) -> crate::error::Result<()>;

    async fn save_hard_state(&self, state: &HardState) -> crate::error::Result<()>;

    async fn save_snapshot(&self, snapshot: &Snapshot) -> crate::error::Result<()>;

    /// Discards log entries folded into a newly durable snapshot.
    async fn compact_log(&self, up_to_index: LogIndex) -> crate::error::Result<()>;

    /// Reconstructs everything durably recorded, for use at startup.
    async fn load_all(&self) -> crate::error::Result<LoadedState>;
}
