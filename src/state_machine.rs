//! The applied state machine: a deterministic key/value store. Every
//! committed `Normal` log entry decodes to a `Command` and is applied in
//! log order; `ConfChange`/`NoOp` entries advance `applied_index` without
//! touching the map.

use crate::log::{EntryKind, LogEntry};
use crate::storage::{ClusterConfiguration, Snapshot};
use crate::types::LogIndex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

#[derive(Debug, Default)]
pub struct KvStateMachine {
    data: HashMap<Vec<u8>, Vec<u8>>,
    applied_index: LogIndex,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.data.get(key)
    }

    pub fn applied_index(&self) -> LogIndex {
        self.applied_index
    }

    /// Applies a run of committed entries in order. `replicate_entry` lets a
    /// caller propose bytes that never have to decode as a `Command`, and a
    /// peer can't be trusted not to have sent something malformed either,
    /// so a decode failure here is logged and the entry's mutation is
    /// skipped rather than panicking the worker task.
    pub fn apply_entries(&mut self, entries: &[LogEntry]) {
        for entry in entries {
            if let EntryKind::Normal = entry.kind {
                if !entry.data.is_empty() {
                    match serde_json::from_slice::<Command>(&entry.data) {
                        Ok(command) => self.apply_command(command),
                        Err(e) => {
                            tracing::warn!(
                                index = entry.index,
                                error = %e,
                                "committed entry did not decode as a Command, skipping its mutation"
                            );
                        }
                    }
                }
            }
            self.applied_index = entry.index;
        }
    }

    fn apply_command(&mut self, command: Command) {
        match command {
            Command::Put { key, value } => {
                self.data.insert(key, value);
            }
            Command::Delete { key } => {
                self.data.remove(&key);
            }
        }
    }

    pub fn snapshot(&self, configuration: ClusterConfiguration, included_term: u64) -> Snapshot {
        let state_blob =
            serde_json::to_vec(&self.data).expect("in-memory map always serializes");
        Snapshot {
            included_index: self.applied_index,
            included_term,
            configuration,
            state_blob,
        }
    }

    pub fn restore(&mut self, snapshot: &Snapshot) {
        self.data = serde_json::from_slice(&snapshot.state_blob)
            .expect("snapshot blobs are only ever produced by `snapshot`");
        self.applied_index = snapshot.included_index;
    }
}

pub fn encode_command(command: &Command) -> Vec<u8> {
    serde_json::to_vec(command).expect("Command always serializes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::EntryKind;

    fn put_entry(index: LogIndex, key: &str, value: &str) -> LogEntry {
        LogEntry {
            index,
            term: 1,
            kind: EntryKind::Normal,
            data: encode_command(&Command::Put {
                key: key.as_bytes().to_vec(),
                value: value.as_bytes().to_vec(),
            }),
        }
    }

    #[test]
    fn put_then_get() {
        let mut sm = KvStateMachine::new();
        sm.apply_entries(&[put_entry(1, "a", "1")]);
        assert_eq!(sm.get(b"a"), Some(&b"1".to_vec()));
        assert_eq!(sm.applied_index(), 1);
    }

    #[test]
    fn delete_removes_key() {
        let mut sm = KvStateMachine::new();
        sm.apply_entries(&[put_entry(1, "a", "1")]);
        let delete_entry = LogEntry {
            index: 2,
            term: 1,
            kind: EntryKind::Normal,
            data: encode_command(&Command::Delete {
                key: b"a".to_vec(),
            }),
        };
        sm.apply_entries(&[delete_entry]);
        assert_eq!(sm.get(b"a"), None);
    }

    #[test]
    fn noop_entries_advance_applied_index_without_mutation() {
        let mut sm = KvStateMachine::new();
        let entry = LogEntry {
            index: 1,
            term: 1,
            kind: EntryKind::NoOp,
            data: vec![],
        };
        sm.apply_entries(&[entry]);
        assert_eq!(sm.applied_index(), 1);
        assert_eq!(sm.get(b"anything"), None);
    }

    #[test]
    fn malformed_entry_is_skipped_not_panicked() {
        let mut sm = KvStateMachine::new();
        sm.apply_entries(&[put_entry(1, "a", "1")]);
        let malformed = LogEntry {
            index: 2,
            term: 1,
            kind: EntryKind::Normal,
            data: vec![0xff, 0x00, 0x13],
        };
        sm.apply_entries(&[malformed]);
        assert_eq!(sm.applied_index(), 2, "applied_index still advances past a malformed entry");
        assert_eq!(sm.get(b"a"), Some(&b"1".to_vec()), "prior state is untouched");
    }

    #[test]
    fn snapshot_and_restore_round_trip() {
        let mut sm = KvStateMachine::new();
        sm.apply_entries(&[put_entry(1, "a", "1"), put_entry(2, "b", "2")]);
        let snapshot = sm.snapshot(ClusterConfiguration::new([1, 2, 3]), 1);

        let mut restored = KvStateMachine::new();
        restored.restore(&snapshot);
        assert_eq!(restored.get(b"a"), Some(&b"1".to_vec()));
        assert_eq!(restored.get(b"b"), Some(&b"2".to_vec()));
        assert_eq!(restored.applied_index(), 2);
    }
}
