//! Core identifiers shared by the consensus engine, storage and transport.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a cluster member. `0` is reserved and never assigned to a
/// real node; it is used as the "no leader known" / "no vote cast" sentinel.
pub type NodeId = u64;

/// Election term number. Monotonically non-decreasing for the lifetime of
/// a cluster.
pub type Term = u64;

/// Position in the replicated log, 1-based. Index `0` means "no entries".
pub type LogIndex = u64;

/// Bounded, validated cluster tag exchanged in the transport handshake.
///
/// Kept deliberately small (ASCII, `<= 64` bytes) so it can be compared
/// byte-for-byte without allocation churn on every incoming connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterName(String);

impl ClusterName {
    pub const MAX_LEN: usize = 64;

    pub fn new(name: impl Into<String>) -> Result<Self, ClusterNameError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ClusterNameError::Empty);
        }
        if name.len() > Self::MAX_LEN {
            return Err(ClusterNameError::TooLong(name.len()));
        }
        if !name.is_ascii() {
            return Err(ClusterNameError::NotAscii);
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterNameError {
    #[error("cluster name must not be empty")]
    Empty,
    #[error("cluster name too long: {0} bytes (max {})", ClusterName::MAX_LEN)]
    TooLong(usize),
    #[error("cluster name must be ASCII")]
    NotAscii,
}

/// The role a node currently occupies in the consensus protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// A cluster member's network address, carried alongside its `NodeId` in
/// `ConfChange` payloads and in `ClusterConfiguration` so the control
/// surface can report where every member actually lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The worker task's own lifecycle, independent of its Raft role — a
/// `Stopped` worker refuses every command regardless of what the engine
/// last thought its role was.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Starting => write!(f, "starting"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Stopping => write!(f, "stopping"),
            WorkerState::Stopped => write!(f, "stopped"),
        }
    }
}
