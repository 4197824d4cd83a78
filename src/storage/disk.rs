//! Disk-backed `Storage`: a hard-state file, a segmented append-only log,
//! and a snapshot file, each written with a temp-file-then-rename dance and
//! an `fsync` before the call returns.

use crate::error::{RaftError, Result};
use crate::log::LogEntry;
use crate::storage::{HardState, LoadedState, Snapshot, Storage};
use crate::types::LogIndex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SEGMENT_ROLLOVER_BYTES: u64 = 64 * 1024 * 1024;

fn write_err(e: impl std::fmt::Display) -> RaftError {
    RaftError::StorageWrite(e.to_string())
}

fn read_err(e: impl std::fmt::Display) -> RaftError {
    RaftError::StorageRead(e.to_string())
}

pub struct DiskStorage {
    hard_state_path: PathBuf,
    snapshot_path: PathBuf,
    log_dir: PathBuf,
    inner: Mutex<DiskStorageInner>,
}

struct DiskStorageInner {
    /// base index of every on-disk segment, in ascending order.
    segments: Vec<LogIndex>,
}

impl DiskStorage {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let log_dir = data_dir.join("log");
        fs::create_dir_all(&log_dir)?;

        let mut segments: Vec<LogIndex> = fs::read_dir(&log_dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                e.file_name()
                    .to_str()
                    .and_then(|name| name.strip_suffix(".seg"))
                    .and_then(|base| base.parse::<LogIndex>().ok())
            })
            .collect();
        segments.sort_unstable();

        Ok(Self {
            hard_state_path: data_dir.join("hardstate.bin"),
            snapshot_path: data_dir.join("snapshot.bin"),
            log_dir,
            inner: Mutex::new(DiskStorageInner { segments }),
        })
    }

    fn segment_path(&self, base_index: LogIndex) -> PathBuf {
        self.log_dir.join(format!("{base_index:020}.seg"))
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path).map_err(write_err)?;
            file.write_all(bytes).map_err(write_err)?;
            file.sync_all().map_err(write_err)?;
        }
        fs::rename(&tmp_path, path).map_err(write_err)?;
        if let Some(parent) = path.parent() {
            // Fsync the directory entry so the rename itself survives a crash.
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    fn read_segment(path: &Path) -> Result<Vec<LogEntry>> {
        let mut file = File::open(path).map_err(read_err)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).map_err(read_err)?;

        let mut entries = Vec::new();
        let mut cursor = 0usize;
        while cursor < buf.len() {
            if cursor + 8 > buf.len() {
                break; // torn write at the tail; stop reading
            }
            let len = u32::from_be_bytes(buf[cursor..cursor + 4].try_into().unwrap()) as usize;
            let crc = u32::from_be_bytes(buf[cursor + 4..cursor + 8].try_into().unwrap());
            cursor += 8;
            if cursor + len > buf.len() {
                break;
            }
            let payload = &buf[cursor..cursor + len];
            if crc32c::crc32c(payload) != crc {
                break; // checksum mismatch at the tail means a torn write, not corruption earlier in the file
            }
            let (entry, _): (LogEntry, usize) =
                bincode::serde::decode_from_slice(payload, bincode::config::standard())
                    .map_err(|e| RaftError::Corruption(format!("log entry: {e}")))?;
            entries.push(entry);
            cursor += len;
        }
        Ok(entries)
    }

    fn encode_entry(entry: &LogEntry) -> Result<Vec<u8>> {
        let payload = bincode::serde::encode_to_vec(entry, bincode::config::standard()).map_err(write_err)?;
        let crc = crc32c::crc32c(&payload);
        let mut out = Vec::with_capacity(8 + payload.len());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&crc.to_be_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }
}

#[async_trait::async_trait]
impl Storage for DiskStorage {
    async fn append(&self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        let base_index = *inner.segments.last().unwrap_or(&entries[0].index);
        let path = self.segment_path(base_index);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(write_err)?;
        for entry in entries {
            file.write_all(&Self::encode_entry(entry)?).map_err(write_err)?;
        }
        file.sync_data().map_err(write_err)?;

        if !inner.segments.contains(&base_index) {
            inner.segments.push(base_index);
        }

        let size = file.metadata().map_err(write_err)?.len();
        if size > SEGMENT_ROLLOVER_BYTES {
            let next_base = entries.last().unwrap().index + 1;
            inner.segments.push(next_base);
        }
        Ok(())
    }

    async fn truncate_from(&self, index: LogIndex) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let mut kept_entries = Vec::new();
        let mut removed_segments = Vec::new();

        for &base in &inner.segments {
            let path = self.segment_path(base);
            if !path.exists() {
                continue;
            }
            let entries = Self::read_segment(&path)?;
            let mut keep: Vec<LogEntry> = entries.into_iter().filter(|e| e.index < index).collect();
            if keep.is_empty() && base >= index {
                removed_segments.push(base);
                continue;
            }
            kept_entries.append(&mut keep);
        }
        drop(inner);

        for base in &removed_segments {
            let _ = fs::remove_file(self.segment_path(*base));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.segments.retain(|b| !removed_segments.contains(b));

        // Rewrite the tail segment (the one truncation actually cut into)
        // with only the surviving entries.
        if let Some(&base) = inner.segments.last() {
            let surviving: Vec<LogEntry> = kept_entries
                .into_iter()
                .filter(|e| e.index >= base)
                .collect();
            let mut bytes = Vec::new();
            for entry in &surviving {
                bytes.extend_from_slice(&Self::encode_entry(entry)?);
            }
            Self::write_atomic(&self.segment_path(base), &bytes)?;
        }
        Ok(())
    }

    async fn save_hard_state(&self, state: &HardState) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(state, bincode::config::standard()).map_err(write_err)?;
        Self::write_atomic(&self.hard_state_path, &bytes)
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(snapshot, bincode::config::standard()).map_err(write_err)?;
        Self::write_atomic(&self.snapshot_path, &bytes)
    }

    async fn compact_log(&self, up_to_index: LogIndex) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let mut removed = Vec::new();
        for &base in &inner.segments {
            let path = self.segment_path(base);
            let entries = Self::read_segment(&path)?;
            if entries.iter().all(|e| e.index <= up_to_index) && !entries.is_empty() {
                removed.push(base);
            }
        }
        inner.segments.retain(|b| !removed.contains(b));
        drop(inner);
        for base in removed {
            let _ = fs::remove_file(self.segment_path(base));
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<LoadedState> {
        let hard_state = if self.hard_state_path.exists() {
            let bytes = fs::read(&self.hard_state_path).map_err(read_err)?;
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map(|(s, _)| s)
                .map_err(|e| RaftError::Corruption(format!("hard state: {e}")))?
        } else {
            HardState::default()
        };

        let snapshot = if self.snapshot_path.exists() {
            let bytes = fs::read(&self.snapshot_path).map_err(read_err)?;
            Some(
                bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                    .map(|(s, _)| s)
                    .map_err(|e| RaftError::Corruption(format!("snapshot: {e}")))?,
            )
        } else {
            None
        };

        let inner = self.inner.lock().unwrap();
        let mut entries = Vec::new();
        for &base in &inner.segments {
            entries.extend(Self::read_segment(&self.segment_path(base))?);
        }

        Ok(LoadedState {
            hard_state,
            snapshot,
            entries,
        })
    }
}
