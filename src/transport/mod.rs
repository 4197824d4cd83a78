//! Wire protocol: a length-prefixed frame carrying one `Envelope`.
//!
//! ```text
//! Length(4, big-endian) | Envelope (bincode) | CRC32C(4, big-endian)
//! ```
//!
//! `Envelope` carries a `message_id` used only for log correlation — the
//! protocol has no request/response matching requirement beyond what the
//! consensus messages already carry (`term`, `leader_id`, etc).

pub mod handshake;
pub mod tcp;

use crate::log::LogEntry;
use crate::storage::{ClusterConfiguration, Snapshot};
use crate::types::{ClusterName, LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: u64,
    pub body: Message,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Handshake(HandshakePreamble),
    RequestVote(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakePreamble {
    pub cluster_name: ClusterName,
    pub node_id: NodeId,
    pub term_hint: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub voter_id: NodeId,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
    /// Set for a heartbeat carrying no new entries but still wanting a
    /// prompt ack, used by the read-index quorum-check round.
    pub read_index_probe: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub follower_id: NodeId,
    pub success: bool,
    /// Fast-rollback hints used when `success` is false.
    pub conflict_index: LogIndex,
    pub conflict_term: Term,
    pub read_index_probe: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub included_index: LogIndex,
    pub included_term: Term,
    pub configuration: ClusterConfiguration,
    pub state_blob: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub follower_id: NodeId,
    pub included_index: LogIndex,
}

impl InstallSnapshotRequest {
    pub fn into_snapshot(self) -> Snapshot {
        Snapshot {
            included_index: self.included_index,
            included_term: self.included_term,
            configuration: self.configuration,
            state_blob: self.state_blob,
        }
    }
}

/// Encodes a frame: 4-byte big-endian length, bincode payload, CRC32C.
pub fn encode_frame(message_id: u64, message: &Message) -> crate::error::Result<Vec<u8>> {
    let envelope = Envelope {
        message_id,
        body: message.clone(),
    };
    let payload = bincode::serde::encode_to_vec(&envelope, bincode::config::standard())?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(crate::error::RaftError::MalformedMessage {
            peer: 0,
            reason: format!("encoded frame of {} bytes exceeds the {} byte limit", payload.len(), MAX_FRAME_SIZE),
        });
    }
    let checksum = crc32c::crc32c(&payload);

    let mut out = Vec::with_capacity(4 + payload.len() + 4);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&checksum.to_be_bytes());
    Ok(out)
}

/// Decodes a frame's payload (length prefix and trailing checksum already
/// stripped by the caller — see `tcp::read_frame`).
pub fn decode_payload(peer: NodeId, payload: &[u8], checksum: u32) -> crate::error::Result<Envelope> {
    if crc32c::crc32c(payload) != checksum {
        return Err(crate::error::RaftError::MalformedMessage {
            peer,
            reason: "frame checksum mismatch".to_string(),
        });
    }
    let (envelope, _) = bincode::serde::decode_from_slice(payload, bincode::config::standard())
        .map_err(|e| crate::error::RaftError::MalformedMessage {
            peer,
            reason: e.to_string(),
        })?;
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let message = Message::RequestVote(RequestVoteRequest {
            term: 3,
            candidate_id: 1,
            last_log_index: 10,
            last_log_term: 2,
        });
        let frame = encode_frame(42, &message).unwrap();

        let len = u32::from_be_bytes(frame[0..4].try_into().unwrap()) as usize;
        let payload = &frame[4..4 + len];
        let checksum = u32::from_be_bytes(frame[4 + len..4 + len + 4].try_into().unwrap());

        let envelope = decode_payload(1, payload, checksum).unwrap();
        assert_eq!(envelope.message_id, 42);
        match envelope.body {
            Message::RequestVote(req) => assert_eq!(req.candidate_id, 1),
            _ => panic!("wrong message kind"),
        }
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let message = Message::AppendEntriesResponse(AppendEntriesResponse {
            term: 1,
            follower_id: 2,
            success: true,
            conflict_index: 0,
            conflict_term: 0,
            read_index_probe: None,
        });
        let mut frame = encode_frame(1, &message).unwrap();
        let len = u32::from_be_bytes(frame[0..4].try_into().unwrap()) as usize;
        frame[4] ^= 0xFF; // flip a payload byte
        let payload = &frame[4..4 + len];
        let checksum = u32::from_be_bytes(frame[4 + len..4 + len + 4].try_into().unwrap());

        assert!(decode_payload(2, payload, checksum).is_err());
    }
}
