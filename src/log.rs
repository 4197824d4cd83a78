//! In-memory replicated log representation.
//!
//! The engine operates purely on this structure; `storage` is responsible
//! for making every mutation durable before the engine acts on it.

use crate::types::{Endpoint, LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Normal,
    ConfChange(ConfChangeOp),
    NoOp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChangeOp {
    AddNode(NodeId, Endpoint),
    RemoveNode(NodeId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub kind: EntryKind,
    pub data: Vec<u8>,
}

/// Replicated log: a contiguous run of entries starting at `first_index`,
/// with everything before it folded into `snapshot`.
#[derive(Debug, Default)]
pub struct RaftLog {
    entries: std::collections::VecDeque<LogEntry>,
    /// Index of the first entry in `entries`. One past the snapshot's
    /// included index.
    first_index: LogIndex,
}

impl RaftLog {
    pub fn new(first_index: LogIndex) -> Self {
        Self {
            entries: std::collections::VecDeque::new(),
            first_index,
        }
    }

    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    pub fn last_index(&self) -> LogIndex {
        self.first_index + self.entries.len() as LogIndex - 1
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Term at `index`, or `None` if `index` is outside the retained range.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index {
            return None;
        }
        let offset = (index - self.first_index) as usize;
        self.entries.get(offset)
    }

    pub fn get_range(&self, start: LogIndex, end: LogIndex) -> Vec<LogEntry> {
        if start > end || start < self.first_index {
            return Vec::new();
        }
        let last = self.last_index().min(end);
        let mut out = Vec::new();
        let mut idx = start;
        while idx <= last {
            if let Some(entry) = self.get(idx) {
                out.push(entry.clone());
            }
            idx += 1;
        }
        out
    }

    /// Appends a single entry authored locally. Must be contiguous.
    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1, "log append must be contiguous");
        self.entries.push_back(entry);
    }

    /// Appends entries received from a leader, truncating any conflicting
    /// suffix first. Returns the index of the first entry actually applied
    /// to the in-memory log (entries already present with matching term are
    /// skipped, matching the Raft paper's "if an existing entry conflicts
    /// with a new one ... delete the existing entry and all that follow it"
    /// rule, and otherwise a no-op for duplicates).
    pub fn append_entries(&mut self, entries: &[LogEntry]) {
        for entry in entries {
            match self.term_at(entry.index) {
                Some(existing_term) if existing_term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(entry.index);
                    self.entries.push_back(entry.clone());
                }
                None => {
                    self.entries.push_back(entry.clone());
                }
            }
        }
    }

    /// Removes `index` and everything after it.
    pub fn truncate_from(&mut self, index: LogIndex) {
        if index < self.first_index {
            self.entries.clear();
            return;
        }
        let keep = (index - self.first_index) as usize;
        self.entries.truncate(keep);
    }

    /// Discards entries up to and including `up_to_index`, recording the new
    /// logical start of the log after a snapshot is installed.
    pub fn compact(&mut self, up_to_index: LogIndex) {
        if up_to_index < self.first_index {
            return;
        }
        let drop_count = (up_to_index + 1).saturating_sub(self.first_index) as usize;
        for _ in 0..drop_count.min(self.entries.len()) {
            self.entries.pop_front();
        }
        self.first_index = up_to_index + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: LogIndex, term: Term) -> LogEntry {
        LogEntry {
            index,
            term,
            kind: EntryKind::Normal,
            data: vec![],
        }
    }

    #[test]
    fn empty_log_reports_index_zero() {
        let log = RaftLog::new(1);
        assert!(log.is_empty());
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(1), None);
    }

    #[test]
    fn append_is_contiguous() {
        let mut log = RaftLog::new(1);
        log.append(entry(1, 1));
        log.append(entry(2, 1));
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.get(2).unwrap().term, 1);
    }

    #[test]
    fn append_entries_truncates_on_conflict() {
        let mut log = RaftLog::new(1);
        log.append(entry(1, 1));
        log.append(entry(2, 1));
        log.append(entry(3, 1));

        // Leader with a higher term overwrites the conflicting suffix.
        log.append_entries(&[entry(2, 2), entry(3, 2)]);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(2), Some(2));
        assert_eq!(log.term_at(3), Some(2));
    }

    #[test]
    fn append_entries_skips_exact_duplicates() {
        let mut log = RaftLog::new(1);
        log.append(entry(1, 1));
        log.append_entries(&[entry(1, 1)]);
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn get_range_respects_bounds() {
        let mut log = RaftLog::new(1);
        for i in 1..=5 {
            log.append(entry(i, 1));
        }
        let range = log.get_range(2, 4);
        assert_eq!(range.len(), 3);
        assert_eq!(range[0].index, 2);
        assert_eq!(range[2].index, 4);
    }

    #[test]
    fn compact_shifts_first_index() {
        let mut log = RaftLog::new(1);
        for i in 1..=5 {
            log.append(entry(i, 1));
        }
        log.compact(3);
        assert_eq!(log.first_index(), 4);
        assert_eq!(log.get(3), None);
        assert_eq!(log.get(4).unwrap().index, 4);
    }
}
