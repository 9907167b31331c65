use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use super::RaftError;

/// One replicated unit of state change. Entries are 1-based; index 0 is a
/// sentinel so prev-index checks have a base case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Vec<u8>,
}

/// Term and vote that must survive restarts. Written before any reply that
/// references them leaves the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<String>,
}

impl HardState {
    fn path(data_dir: &str) -> PathBuf {
        PathBuf::from(data_dir).join("raft").join("hard_state.bin")
    }

    /// Load persisted term/vote, or the zero state on first boot.
    pub fn load(data_dir: &str) -> Result<Self, RaftError> {
        let path = Self::path(data_dir);
        if !path.exists() {
            return Ok(Self {
                current_term: 0,
                voted_for: None,
            });
        }

        let mut file = File::open(&path)?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        let (state, _): (HardState, usize) =
            bincode::decode_from_slice(&buffer, bincode::config::standard())
                .map_err(|e| RaftError::SerializationError(e.to_string()))?;

        Ok(state)
    }

    pub fn save(&self, data_dir: &str) -> Result<(), RaftError> {
        let path = Self::path(data_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let encoded = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| RaftError::SerializationError(e.to_string()))?;

        let mut file = File::create(&path)?;
        file.write_all(&encoded)?;
        file.sync_all()?;

        Ok(())
    }
}

pub struct Log {
    entries: Vec<LogEntry>,
    log_file: PathBuf,
}

impl Log {
    pub fn new(data_dir: &str) -> Result<Self, RaftError> {
        let log_dir = PathBuf::from(data_dir).join("raft");
        if !log_dir.exists() {
            std::fs::create_dir_all(&log_dir)?;
        }

        let log_file = log_dir.join("log.bin");

        let mut log = Self {
            entries: Vec::new(),
            log_file,
        };

        if log.log_file.exists() {
            log.load_from_disk()?;
        }

        // Sentinel entry at index 0.
        if log.entries.is_empty() {
            log.entries.push(LogEntry {
                term: 0,
                index: 0,
                command: Vec::new(),
            });
        }

        Ok(log)
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64 - 1
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.entries.get(index as usize).map(|e| e.term)
    }

    /// Append one entry and persist it. The entry must carry the next
    /// contiguous index; anything else is the caller mixing up logs.
    pub fn append(&mut self, entry: LogEntry) -> Result<u64, RaftError> {
        let expected = self.entries.len() as u64;
        if entry.index != expected {
            return Err(RaftError::InvalidLogIndex(entry.index));
        }

        self.entries.push(entry);
        self.save_to_disk()?;

        Ok(expected)
    }

    pub fn get_entry(&self, index: u64) -> Option<LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize).cloned()
    }

    /// Entries in `[start, end)`; `None` means through the tail.
    pub fn get_entries(&self, start: u64, end: Option<u64>) -> Vec<LogEntry> {
        let start = start.max(1);
        let end = end
            .unwrap_or(self.entries.len() as u64)
            .min(self.entries.len() as u64);

        if start >= end {
            return Vec::new();
        }

        self.entries[start as usize..end as usize].to_vec()
    }

    /// Drop everything after `index`, keeping `index` itself. Zero keeps
    /// only the sentinel. Rewrites the backing file.
    pub fn truncate(&mut self, index: u64) -> Result<(), RaftError> {
        if index >= self.last_index() {
            return Ok(());
        }

        self.entries.truncate(index as usize + 1);
        self.save_to_disk()?;

        Ok(())
    }

    fn load_from_disk(&mut self) -> Result<(), RaftError> {
        let mut file = File::open(&self.log_file)?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        if buffer.is_empty() {
            return Ok(());
        }

        let (entries, _): (Vec<LogEntry>, usize) =
            bincode::decode_from_slice(&buffer, bincode::config::standard())
                .map_err(|e| RaftError::SerializationError(e.to_string()))?;

        self.entries = entries;

        Ok(())
    }

    // The whole file is rewritten on every mutation. Plenty for logs that
    // fit in memory; an append-only segment format can replace this without
    // touching the callers.
    fn save_to_disk(&self) -> Result<(), RaftError> {
        let encoded = bincode::encode_to_vec(&self.entries, bincode::config::standard())
            .map_err(|e| RaftError::SerializationError(e.to_string()))?;

        let mut file = File::create(&self.log_file)?;
        file.write_all(&encoded)?;
        file.sync_all()?;

        Ok(())
    }
}
