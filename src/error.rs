//! Crate-wide error type.
//!
//! Variants are grouped by the failure taxonomy the engine distinguishes
//! internally: safety-fatal (the worker must stop), liveness-transient (log
//! and retry), caller-visible (returned synchronously from the control
//! surface), and consensus-internal (protocol signals, not failures).

use crate::types::NodeId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RaftError>;

#[derive(Debug, Error, Clone)]
pub enum RaftError {
    // --- Safety-fatal: the worker logs at error! and stops. ---
    #[error("storage write failed: {0}")]
    StorageWrite(String),

    #[error("storage read failed: {0}")]
    StorageRead(String),

    #[error("persisted state is corrupt: {0}")]
    Corruption(String),

    #[error("observed term {observed} moved backwards from {current}")]
    TermRegression { current: u64, observed: u64 },

    // --- Liveness-transient: logged at warn!, retried on the next tick. ---
    #[error("peer {0} unreachable")]
    PeerUnreachable(NodeId),

    #[error("failed to parse message from peer {peer}: {reason}")]
    MalformedMessage { peer: NodeId, reason: String },

    #[error("operation timed out: {0}")]
    Timeout(String),

    // --- Caller-visible: returned synchronously from the control surface. ---
    #[error("not the leader; current leader hint: {leader_hint:?}")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("a configuration change is already in progress")]
    PendingConfChange,

    #[error("node {0} is already a cluster member")]
    DuplicateNode(NodeId),

    #[error("node {0} is not a known cluster member")]
    UnknownNode(NodeId),

    #[error("command queue is full")]
    QueueFull,

    #[error("worker is shutting down")]
    Shutdown,

    #[error("worker has not been initialized")]
    NotInitialized,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // --- Wrapped I/O / (de)serialization errors, surfaced as storage or
    //     transport failures depending on call site. ---
    #[error("I/O error: {0}")]
    Io(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),
}

impl From<std::io::Error> for RaftError {
    fn from(e: std::io::Error) -> Self {
        RaftError::Io(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for RaftError {
    fn from(e: bincode::error::EncodeError) -> Self {
        RaftError::Encode(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for RaftError {
    fn from(e: bincode::error::DecodeError) -> Self {
        RaftError::Decode(e.to_string())
    }
}

impl From<toml::de::Error> for RaftError {
    fn from(e: toml::de::Error) -> Self {
        RaftError::InvalidConfig(e.to_string())
    }
}

impl RaftError {
    /// True for the safety-fatal class: the worker must stop rather than
    /// retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RaftError::StorageWrite(_)
                | RaftError::StorageRead(_)
                | RaftError::Corruption(_)
                | RaftError::TermRegression { .. }
        )
    }
}
